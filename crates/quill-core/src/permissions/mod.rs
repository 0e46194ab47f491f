//! Permission broker.
//!
//! Write-class tool calls that fall outside an agent's configured write
//! globs suspend on a pending approval: the broker records the request,
//! publishes it on the permission stream, and parks the tool-approval
//! callback on a oneshot slot until a client grants or denies it, or a
//! hard timeout elapses. Grant and deny are idempotent; a slot resolves
//! at most once.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};

use crate::agents::AgentDefinition;
use crate::llm::{ApprovalCallback, ApprovalDecision, ToolUse};

/// Tools whose execution mutates state and is therefore gated.
pub const WRITE_TOOLS: [&str; 3] = ["write", "edit", "bash"];

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);
/// Sweeper ceilings: pending requests older than this are dropped...
const SWEEP_PENDING_MAX_AGE: Duration = Duration::from_secs(5 * 60);
/// ...and resolved ones that somehow lingered are dropped sooner.
const SWEEP_RESOLVED_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Pending,
    Granted,
    Denied,
    Timeout,
}

/// A pending (or just-resolved) approval request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// `<session-id>-<tool-use-id>`.
    pub id: String,
    pub tool: String,
    /// Target path for write/edit, or the command string for bash.
    pub subject: Option<String>,
    pub input: serde_json::Value,
    pub agent_name: String,
    pub agent_path: String,
    /// The agent's write globs, for diagnostic display.
    pub allowed_patterns: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub state: PermissionState,
}

/// One denial, carried into the execution's final report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDenial {
    pub tool: String,
    pub subject: Option<String>,
    /// `"denied"` or `"timeout"`.
    pub reason: String,
}

/// Events on the singleton permission stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum PermissionEvent {
    #[serde(rename = "permissionRequest")]
    Request { request: PermissionRequest },
    #[serde(rename = "permissionGranted")]
    Granted { id: String },
    #[serde(rename = "permissionDenied")]
    Denied { id: String },
}

struct PendingEntry {
    request: PermissionRequest,
    slot: oneshot::Sender<bool>,
}

pub struct PermissionBroker {
    pending: RwLock<HashMap<String, PendingEntry>>,
    events: broadcast::Sender<PermissionEvent>,
    timeout: Duration,
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

impl PermissionBroker {
    pub fn new(timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            pending: RwLock::new(HashMap::new()),
            events,
            timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionEvent> {
        self.events.subscribe()
    }

    pub async fn list_pending(&self) -> Vec<PermissionRequest> {
        let pending = self.pending.read().await;
        let mut requests: Vec<_> = pending.values().map(|e| e.request.clone()).collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }

    /// Resolve a pending request as granted. Returns false when nothing
    /// was pending under the id.
    pub async fn grant(&self, id: &str) -> bool {
        self.resolve(id, true).await
    }

    /// Resolve a pending request as denied. Returns false when nothing
    /// was pending under the id.
    pub async fn deny(&self, id: &str) -> bool {
        self.resolve(id, false).await
    }

    async fn resolve(&self, id: &str, approved: bool) -> bool {
        let entry = {
            let mut pending = self.pending.write().await;
            pending.remove(id)
        };
        let Some(entry) = entry else {
            return false;
        };
        // The awaiting callback may already have timed out; the send
        // result does not matter.
        let _ = entry.slot.send(approved);
        let event = if approved {
            PermissionEvent::Granted { id: id.to_string() }
        } else {
            PermissionEvent::Denied { id: id.to_string() }
        };
        let _ = self.events.send(event);
        true
    }

    /// Drop requests stuck past their ceilings. Pending entries removed
    /// here resolve as denied on the awaiting side (their slot drops).
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let pending_cutoff =
            chrono::Duration::from_std(SWEEP_PENDING_MAX_AGE).unwrap_or(chrono::Duration::minutes(5));
        let resolved_cutoff =
            chrono::Duration::from_std(SWEEP_RESOLVED_MAX_AGE).unwrap_or(chrono::Duration::minutes(1));

        let mut pending = self.pending.write().await;
        let before = pending.len();
        pending.retain(|_, entry| {
            let age = now - entry.request.requested_at;
            match entry.request.state {
                PermissionState::Pending => age < pending_cutoff,
                _ => age < resolved_cutoff,
            }
        });
        let swept = before - pending.len();
        if swept > 0 {
            tracing::info!(swept, "swept stale permission requests");
        }
        swept
    }

    /// Build the tool-approval callback for one execution.
    ///
    /// Denials accumulate into `denials` so the caller can report them in
    /// the final result.
    pub fn approval_callback(
        self: &Arc<Self>,
        session_id: String,
        agent: &AgentDefinition,
        vault_root: &Path,
        denials: Arc<Mutex<Vec<PermissionDenial>>>,
    ) -> ApprovalCallback {
        let broker = Arc::clone(self);
        let agent_name = agent.name.clone();
        let agent_path = agent.path.clone();
        let write_patterns = agent.permissions.write.clone();
        let write_matcher = agent.permissions.write_matcher();
        let vault_root = vault_root.to_path_buf();

        Arc::new(move |tool_use: ToolUse| {
            let broker = Arc::clone(&broker);
            let agent_name = agent_name.clone();
            let agent_path = agent_path.clone();
            let write_patterns = write_patterns.clone();
            let write_matcher = write_matcher.clone();
            let vault_root = vault_root.clone();
            let session_id = session_id.clone();
            let denials = Arc::clone(&denials);

            let fut: crate::llm::ApprovalFuture = Box::pin(async move {
                if !WRITE_TOOLS.contains(&tool_use.name.as_str()) {
                    return ApprovalDecision::Allow {
                        updated_input: None,
                    };
                }

                let subject = match tool_use.name.as_str() {
                    "bash" => {
                        if write_matcher.allows_any() {
                            return ApprovalDecision::Allow {
                                updated_input: None,
                            };
                        }
                        extract_command(&tool_use.input)
                    }
                    _ => {
                        match extract_write_target(&tool_use.input, &vault_root) {
                            Some(target) => {
                                if write_matcher.matches(&target) {
                                    return ApprovalDecision::Allow {
                                        updated_input: None,
                                    };
                                }
                                Some(target)
                            }
                            // No identifiable subject: nothing to gate on.
                            None => {
                                return ApprovalDecision::Allow {
                                    updated_input: None,
                                }
                            }
                        }
                    }
                };

                let Some(subject) = subject else {
                    return ApprovalDecision::Allow {
                        updated_input: None,
                    };
                };

                broker
                    .await_approval(
                        session_id,
                        agent_name,
                        agent_path,
                        write_patterns,
                        tool_use,
                        subject,
                        denials,
                    )
                    .await
            });
            fut
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn await_approval(
        self: Arc<Self>,
        session_id: String,
        agent_name: String,
        agent_path: String,
        allowed_patterns: Vec<String>,
        tool_use: ToolUse,
        subject: String,
        denials: Arc<Mutex<Vec<PermissionDenial>>>,
    ) -> ApprovalDecision {
        let id = format!("{}-{}", session_id, tool_use.id);
        let request = PermissionRequest {
            id: id.clone(),
            tool: tool_use.name.clone(),
            subject: Some(subject.clone()),
            input: tool_use.input.clone(),
            agent_name,
            agent_path,
            allowed_patterns,
            requested_at: Utc::now(),
            state: PermissionState::Pending,
        };

        let (slot_tx, slot_rx) = oneshot::channel();
        {
            let mut pending = self.pending.write().await;
            pending.insert(
                id.clone(),
                PendingEntry {
                    request: request.clone(),
                    slot: slot_tx,
                },
            );
        }
        let _ = self.events.send(PermissionEvent::Request { request });
        tracing::info!(request_id = %id, tool = %tool_use.name, subject = %subject, "permission requested");

        let outcome = tokio::time::timeout(self.timeout, slot_rx).await;

        // The entry is gone already when grant/deny resolved it; on
        // timeout (or a swept slot) remove it here, before any handler
        // observes the result.
        {
            let mut pending = self.pending.write().await;
            pending.remove(&id);
        }

        match outcome {
            Ok(Ok(true)) => {
                tracing::info!(request_id = %id, "permission granted");
                ApprovalDecision::Allow {
                    updated_input: Some(tool_use.input),
                }
            }
            Ok(Ok(false)) | Ok(Err(_)) => {
                tracing::info!(request_id = %id, "permission denied");
                denials.lock().await.push(PermissionDenial {
                    tool: tool_use.name.clone(),
                    subject: Some(subject.clone()),
                    reason: "denied".to_string(),
                });
                ApprovalDecision::Deny {
                    message: format!(
                        "Write to `{}` was denied by the user; do not retry this operation.",
                        subject
                    ),
                }
            }
            Err(_) => {
                tracing::warn!(request_id = %id, "permission request timed out");
                let _ = self.events.send(PermissionEvent::Denied { id: id.clone() });
                denials.lock().await.push(PermissionDenial {
                    tool: tool_use.name.clone(),
                    subject: Some(subject.clone()),
                    reason: "timeout".to_string(),
                });
                ApprovalDecision::Deny {
                    message: format!(
                        "No approval for writing `{}` arrived within {} seconds; the operation was not performed.",
                        subject,
                        self.timeout.as_secs()
                    ),
                }
            }
        }
    }
}

/// Pull the write target out of a schema-free tool input and normalize it
/// to vault-relative form.
fn extract_write_target(input: &serde_json::Value, vault_root: &Path) -> Option<String> {
    let raw = input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(|v| v.as_str())?;

    let path = Path::new(raw);
    if path.is_absolute() {
        path.strip_prefix(vault_root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .or(Some(raw.to_string()))
    } else {
        Some(raw.trim_start_matches("./").to_string())
    }
}

fn extract_command(input: &serde_json::Value) -> Option<String> {
    input
        .get("command")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentKind, AgentPermissions};
    use serde_json::json;

    fn agent_with_write(globs: &[&str]) -> AgentDefinition {
        AgentDefinition {
            path: "agents/helper.md".into(),
            name: "helper".into(),
            description: None,
            kind: AgentKind::Chatbot,
            model: None,
            tools: None,
            permissions: AgentPermissions {
                write: globs.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            max_spawn_depth: None,
            context_files: Vec::new(),
            services: Vec::new(),
            system_prompt: String::new(),
        }
    }

    fn tool_use(name: &str, input: serde_json::Value) -> ToolUse {
        ToolUse {
            id: "tu-1".into(),
            name: name.into(),
            input,
        }
    }

    fn callback_for(
        broker: &Arc<PermissionBroker>,
        agent: &AgentDefinition,
    ) -> (ApprovalCallback, Arc<Mutex<Vec<PermissionDenial>>>) {
        let denials = Arc::new(Mutex::new(Vec::new()));
        let cb = broker.approval_callback(
            "sess-1".into(),
            agent,
            Path::new("/vault"),
            Arc::clone(&denials),
        );
        (cb, denials)
    }

    #[tokio::test]
    async fn read_tools_pass_through() {
        let broker = Arc::new(PermissionBroker::default());
        let (cb, _) = callback_for(&broker, &agent_with_write(&[]));
        let decision = cb(tool_use("read", json!({"file_path": "/etc/passwd"}))).await;
        assert!(matches!(decision, ApprovalDecision::Allow { .. }));
        assert!(broker.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn in_policy_write_is_allowed_without_a_request() {
        let broker = Arc::new(PermissionBroker::default());
        let (cb, _) = callback_for(&broker, &agent_with_write(&["notes/*"]));
        let decision = cb(tool_use("write", json!({"file_path": "notes/today.md"}))).await;
        assert!(matches!(decision, ApprovalDecision::Allow { .. }));
        assert!(broker.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn absolute_path_is_normalized_before_matching() {
        let broker = Arc::new(PermissionBroker::default());
        let (cb, _) = callback_for(&broker, &agent_with_write(&["notes/*"]));
        let decision = cb(tool_use("write", json!({"file_path": "/vault/notes/today.md"}))).await;
        assert!(matches!(decision, ApprovalDecision::Allow { .. }));
    }

    #[tokio::test]
    async fn out_of_policy_write_waits_and_deny_resolves_it() {
        let broker = Arc::new(PermissionBroker::default());
        let agent = agent_with_write(&["notes/*"]);
        let (cb, denials) = callback_for(&broker, &agent);
        let mut events = broker.subscribe();

        let pending_task = tokio::spawn(cb(tool_use(
            "write",
            json!({"file_path": "projects/secret.txt"}),
        )));

        // The request shows up on the stream with the composed id.
        let event = events.recv().await.unwrap();
        let PermissionEvent::Request { request } = event else {
            panic!("expected a request event");
        };
        assert_eq!(request.id, "sess-1-tu-1");
        assert_eq!(request.subject.as_deref(), Some("projects/secret.txt"));
        assert_eq!(broker.list_pending().await.len(), 1);

        assert!(broker.deny("sess-1-tu-1").await);
        let decision = pending_task.await.unwrap();
        assert!(matches!(decision, ApprovalDecision::Deny { .. }));

        // Entry is gone and the denial was recorded with reason "denied".
        assert!(broker.list_pending().await.is_empty());
        let denials = denials.lock().await;
        assert_eq!(denials.len(), 1);
        assert_eq!(denials[0].reason, "denied");

        // Resolving again is a safe no-op.
        assert!(!broker.deny("sess-1-tu-1").await);
        assert!(!broker.grant("sess-1-tu-1").await);
    }

    #[tokio::test]
    async fn grant_returns_the_input() {
        let broker = Arc::new(PermissionBroker::default());
        let agent = agent_with_write(&["notes/*"]);
        let (cb, denials) = callback_for(&broker, &agent);

        let input = json!({"file_path": "projects/secret.txt", "content": "x"});
        let pending_task = tokio::spawn(cb(tool_use("write", input.clone())));

        // Wait for the request to register, then grant.
        for _ in 0..50 {
            if !broker.list_pending().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(broker.grant("sess-1-tu-1").await);

        let decision = pending_task.await.unwrap();
        match decision {
            ApprovalDecision::Allow { updated_input } => {
                assert_eq!(updated_input, Some(input));
            }
            other => panic!("expected allow, got {:?}", other),
        }
        assert!(denials.lock().await.is_empty());
    }

    #[tokio::test]
    async fn timeout_denies_with_timeout_reason() {
        let broker = Arc::new(PermissionBroker::new(Duration::from_millis(30)));
        let agent = agent_with_write(&["notes/*"]);
        let (cb, denials) = callback_for(&broker, &agent);

        let decision = cb(tool_use("write", json!({"file_path": "projects/x.txt"}))).await;
        assert!(matches!(decision, ApprovalDecision::Deny { .. }));
        assert_eq!(denials.lock().await[0].reason, "timeout");
        assert!(broker.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn bash_gates_on_the_command_string() {
        let broker = Arc::new(PermissionBroker::new(Duration::from_millis(30)));
        let agent = agent_with_write(&["notes/*"]);
        let (cb, _) = callback_for(&broker, &agent);

        let task = tokio::spawn(cb(tool_use("bash", json!({"command": "rm -rf /tmp/x"}))));
        for _ in 0..50 {
            let pending = broker.list_pending().await;
            if let Some(request) = pending.first() {
                assert_eq!(request.subject.as_deref(), Some("rm -rf /tmp/x"));
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let _ = task.await;

        // An unrestricted write policy lets bash through untouched.
        let open_agent = agent_with_write(&["*"]);
        let (open_cb, _) = callback_for(&broker, &open_agent);
        let decision = open_cb(tool_use("bash", json!({"command": "ls"}))).await;
        assert!(matches!(decision, ApprovalDecision::Allow { .. }));
    }

    #[tokio::test]
    async fn sweep_drops_stuck_requests() {
        let broker = Arc::new(PermissionBroker::default());
        // Insert a pending entry dated in the past directly.
        let (tx, _rx) = oneshot::channel();
        broker.pending.write().await.insert(
            "old".to_string(),
            PendingEntry {
                request: PermissionRequest {
                    id: "old".into(),
                    tool: "write".into(),
                    subject: None,
                    input: serde_json::Value::Null,
                    agent_name: "a".into(),
                    agent_path: "agents/a.md".into(),
                    allowed_patterns: Vec::new(),
                    requested_at: Utc::now() - chrono::Duration::minutes(10),
                    state: PermissionState::Pending,
                },
                slot: tx,
            },
        );
        assert_eq!(broker.sweep().await, 1);
        assert!(broker.list_pending().await.is_empty());
    }
}
