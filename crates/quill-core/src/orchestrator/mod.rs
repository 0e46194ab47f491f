//! Orchestrator core.
//!
//! Composes the vault, queue, sessions, permissions, and event streams
//! into three execution entry points (immediate, streaming, queued) plus
//! the background loops: queue drain, trigger evaluation, session
//! eviction, and permission sweeping.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::agents::{AgentDefinition, AgentKind, AgentLoader};
use crate::events::{EventBus, StreamEvent, STREAM_LINGER};
use crate::llm::{LlmClient, LlmError, LlmEvent, QueryOptions, ToolUse};
use crate::permissions::{PermissionBroker, PermissionDenial};
use crate::queue::{
    EnqueueRequest, ExecutionContext, ExecutionQueue, Priority, QueueError, QueueItem,
};
use crate::scanner::{AgentStatus, DocumentScanner, StatusExtras};
use crate::sessions::context::{build_execution_context, ResumeInfo, DEFAULT_TOKEN_BUDGET};
use crate::sessions::record::{Role, SessionScope};
use crate::sessions::SessionStore;
use crate::vault::Vault;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
const TRIGGER_INTERVAL: Duration = Duration::from_secs(60);
const TRIGGER_BOOT_DELAY: Duration = Duration::from_secs(5);
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const PERMISSION_SWEEP_INTERVAL: Duration = Duration::from_secs(2 * 60);
const MAINTENANCE_BOOT_DELAY: Duration = Duration::from_secs(30);
const SESSION_MAX_AGE_DAYS: i64 = 90;
/// Token cap for context files folded into the system prompt.
const SYSTEM_CONTEXT_TOKEN_BUDGET: usize = 10_000;

static SPAWN_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```spawn\s*\n(.*?)```").expect("valid spawn regex"));

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Cap on concurrent queue-driven executions. Immediate and streaming
    /// runs are not counted against it.
    pub max_concurrent: usize,
    pub max_spawn_depth: u32,
    pub context_token_budget: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_spawn_depth: 2,
            context_token_budget: DEFAULT_TOKEN_BUDGET,
        }
    }
}

/// Shared services the orchestrator composes.
#[derive(Clone)]
pub struct OrchestratorServices {
    pub vault: Arc<Vault>,
    pub agents: Arc<AgentLoader>,
    pub queue: Arc<ExecutionQueue>,
    pub sessions: Arc<SessionStore>,
    pub scanner: Arc<DocumentScanner>,
    pub broker: Arc<PermissionBroker>,
    pub events: Arc<EventBus>,
    /// `None` runs the server in degraded mode: executions fail fast with
    /// a configuration error.
    pub llm: Option<Arc<dyn LlmClient>>,
}

/// One execution request, shared by all three entry points.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub agent_path: String,
    pub message: String,
    pub scope: SessionScope,
    /// Extra system context supplied by the client.
    pub initial_context: Option<String>,
    pub depth: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnedChild {
    pub agent_path: String,
    pub queue_id: String,
    pub priority: Priority,
}

/// Final result record of one execution. Doubles as the body of the
/// streaming `done` event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOutcome {
    pub success: bool,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message_count: usize,
    pub spawned: Vec<SpawnedChild>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub permission_denials: Vec<PermissionDenial>,
    #[serde(rename = "sessionResume", skip_serializing_if = "Option::is_none")]
    pub session_resume: Option<ResumeInfo>,
}

/// Result of one trigger pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerPassReport {
    pub promoted: usize,
    pub enqueued: usize,
}

#[derive(Debug, Deserialize)]
struct SpawnDirective {
    agent: String,
    message: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    context: Option<String>,
}

/// Event sink for one execution: an optional direct channel (streaming
/// entry point) and an optional bus topic (queued runs).
#[derive(Clone, Default)]
struct EventSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
    bus: Option<(Arc<EventBus>, String)>,
}

impl EventSink {
    async fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event.clone()).await;
        }
        if let Some((bus, key)) = &self.bus {
            bus.publish(key, event).await;
        }
    }
}

/// Tracks the previously seen assistant text and yields only new suffixes.
#[derive(Default)]
struct DeltaTracker {
    last: String,
}

impl DeltaTracker {
    fn push(&mut self, text: &str) -> String {
        let delta = match text.strip_prefix(self.last.as_str()) {
            Some(suffix) => suffix.to_string(),
            // Not a prefix extension: a new message started.
            None => text.to_string(),
        };
        self.last = text.to_string();
        delta
    }
}

pub struct Orchestrator {
    services: OrchestratorServices,
    config: OrchestratorConfig,
    drain_nudge: Notify,
    accepting: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(services: OrchestratorServices, config: OrchestratorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            services,
            config,
            drain_nudge: Notify::new(),
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Wake the drain loop, e.g. after an external enqueue.
    pub fn nudge(&self) {
        self.drain_nudge.notify_one();
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Immediate, unary execution.
    pub async fn execute(&self, req: ExecuteRequest) -> Result<ExecuteOutcome> {
        let agent = self.services.agents.load(&req.agent_path).await?;
        Ok(self.run_prepared(agent, req, EventSink::default()).await)
    }

    /// Immediate, streaming execution. The receiver's first event is
    /// always `session`.
    pub async fn execute_streaming(
        self: &Arc<Self>,
        req: ExecuteRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let agent = self.services.agents.load(&req.agent_path).await?;
        let (tx, rx) = mpsc::channel(256);
        let sink = EventSink {
            tx: Some(tx),
            bus: None,
        };
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_prepared(agent, req, sink).await;
        });
        Ok(rx)
    }

    /// Queued execution: appended to the queue, claimed by the drain loop.
    pub async fn enqueue(
        &self,
        agent_path: &str,
        context: ExecutionContext,
        priority: Priority,
        depth: u32,
        spawned_by: Option<String>,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> Result<String> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(anyhow!("server is shutting down; not accepting new work"));
        }
        let agent = self.services.agents.load(agent_path).await?;
        let id = self
            .services
            .queue
            .enqueue(EnqueueRequest {
                agent,
                context,
                priority,
                depth,
                spawned_by,
                scheduled_for,
            })
            .await?;
        self.nudge();
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Inner execution
    // ------------------------------------------------------------------

    async fn run_prepared(
        &self,
        agent: AgentDefinition,
        req: ExecuteRequest,
        sink: EventSink,
    ) -> ExecuteOutcome {
        let started = Instant::now();
        let outcome = self.run_inner(&agent, &req, &sink, started).await;

        match &outcome {
            Ok(outcome) if outcome.success => {
                let result = serde_json::to_value(outcome).unwrap_or_default();
                sink.emit(StreamEvent::Done { result }).await;
            }
            Ok(outcome) => {
                sink.emit(StreamEvent::Error {
                    error: outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "execution failed".to_string()),
                })
                .await;
            }
            Err(e) => {
                sink.emit(StreamEvent::Error {
                    error: format!("{e:#}"),
                })
                .await;
            }
        }

        outcome.unwrap_or_else(|e| ExecuteOutcome {
            success: false,
            response: String::new(),
            error: Some(format!("{e:#}")),
            session_id: None,
            message_count: 0,
            spawned: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            tool_calls: Vec::new(),
            permission_denials: Vec::new(),
            session_resume: None,
        })
    }

    async fn run_inner(
        &self,
        agent: &AgentDefinition,
        req: &ExecuteRequest,
        sink: &EventSink,
        started: Instant,
    ) -> Result<ExecuteOutcome> {
        let llm = self
            .services
            .llm
            .clone()
            .ok_or_else(|| anyhow!("no LLM client configured"))?;

        // Document-bound agents see the target document above the message.
        let mut effective_message = req.message.clone();
        if agent.kind == AgentKind::Document {
            if let Some(doc) = &req.scope.document_path {
                match self.services.vault.read(doc).await {
                    Ok(content) => {
                        effective_message = format!(
                            "## Document: {}\n\n{}\n\n---\n\n{}",
                            doc, content, req.message
                        );
                    }
                    Err(e) => tracing::warn!(doc = %doc, "failed to read target document: {:#}", e),
                }
            }
        }

        // Session setup. Standalone agents skip bookkeeping entirely.
        let uses_session = agent.kind != AgentKind::Standalone;
        let (session, source) = if uses_session {
            let (session, source) = self
                .services
                .sessions
                .get_or_create(agent, &req.scope)
                .await?;
            (Some(session), Some(source))
        } else {
            (None, None)
        };

        let prepared = match (&session, source) {
            (Some(session), Some(source)) => Some(build_execution_context(
                session,
                &effective_message,
                source,
                self.config.context_token_budget,
            )),
            _ => None,
        };

        let session_id = session.as_ref().map(|s| s.id.clone());
        let session_key = session.as_ref().map(|s| s.key.clone());
        let resume_info = prepared.as_ref().map(|p| p.info.clone());

        sink.emit(StreamEvent::Session {
            session_id: session_id.clone(),
            resume: resume_info.clone(),
        })
        .await;

        // The user's submission is persisted verbatim, before the call.
        if let Some(key) = &session_key {
            let _ = self
                .services
                .sessions
                .add_message(key, Role::User, &req.message)
                .await;
        }

        let system_prompt = self.build_system_prompt(agent, req.initial_context.as_deref()).await;
        let denials = Arc::new(Mutex::new(Vec::new()));
        let approval_session = session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let approval = self.services.broker.approval_callback(
            approval_session,
            agent,
            self.services.vault.root(),
            Arc::clone(&denials),
        );

        let allowed_tools = agent.tools.clone().or_else(|| {
            if agent.permissions.tools.is_empty() {
                None
            } else {
                Some(agent.permissions.tools.clone())
            }
        });

        let base_options = QueryOptions {
            model: agent.model.clone(),
            system_prompt: Some(system_prompt),
            allowed_tools,
            resume: None,
            approval: Some(approval),
        };

        let (prompt, resume) = match &prepared {
            Some(p) => (p.prompt.clone(), p.resume.clone()),
            None => (effective_message.clone(), None),
        };

        let mut options = base_options.clone();
        options.resume = resume.clone();

        let mut resume_info = resume_info;
        let mut rx = match llm.query(prompt, options).await {
            Ok(rx) => rx,
            Err(LlmError::ResumeUnavailable) if resume.is_some() && session_key.is_some() => {
                // The upstream session is gone: drop the handle and fall
                // back to context injection within this same call.
                tracing::warn!(
                    agent = %agent.path,
                    "upstream session rejected resume; falling back to context injection"
                );
                let key = session_key.clone().expect("guarded above");
                let _ = self
                    .services
                    .sessions
                    .update_upstream_handle(&key, None)
                    .await;

                let (mut session, source) = self
                    .services
                    .sessions
                    .get_or_create(agent, &req.scope)
                    .await?;
                // The current submission is already persisted; it must
                // not also appear in the injected history.
                if session.messages.last().map(|m| m.role) == Some(Role::User) {
                    session.messages.pop();
                }
                let rebuilt = build_execution_context(
                    &session,
                    &effective_message,
                    source,
                    self.config.context_token_budget,
                );
                resume_info = Some(rebuilt.info.clone());
                let mut options = base_options.clone();
                options.resume = None;
                llm.query(rebuilt.prompt, options)
                    .await
                    .map_err(|e| anyhow!("LLM call failed after resume fallback: {e}"))?
            }
            Err(e) => {
                return self
                    .finish_with_error(agent, sink, &session_key, resume_info, started, e.to_string())
                    .await
            }
        };

        // Stream consumption: delta synthesis plus terminal capture.
        let mut tracker = DeltaTracker::default();
        let mut tool_calls: Vec<ToolCallSummary> = Vec::new();
        let mut final_text = String::new();
        let mut upstream_handle: Option<String> = None;
        let mut failure: Option<String> = None;

        while let Some(event) = rx.recv().await {
            match event {
                LlmEvent::Init { session_id, model } => {
                    if session_id.is_some() {
                        upstream_handle = session_id;
                    }
                    sink.emit(StreamEvent::Init { model }).await;
                }
                LlmEvent::Assistant { text } => {
                    let delta = tracker.push(&text);
                    if !delta.is_empty() {
                        sink.emit(StreamEvent::Text {
                            content: text,
                            delta,
                        })
                        .await;
                    }
                }
                LlmEvent::ToolUse(tool_use) => {
                    let ToolUse { id, name, input } = tool_use;
                    tool_calls.push(ToolCallSummary {
                        id: id.clone(),
                        name: name.clone(),
                    });
                    sink.emit(StreamEvent::ToolUse { id, name, input }).await;
                }
                LlmEvent::Completed { text, session_id } => {
                    final_text = text;
                    if session_id.is_some() {
                        upstream_handle = session_id;
                    }
                }
                LlmEvent::Failed { error } => {
                    failure = Some(error);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            return self
                .finish_with_error(agent, sink, &session_key, resume_info, started, error)
                .await;
        }

        // Persist outcome and refresh the upstream handle.
        let mut message_count = 0;
        if let Some(key) = &session_key {
            let _ = self
                .services
                .sessions
                .add_message(key, Role::Assistant, &final_text)
                .await;
            let _ = self
                .services
                .sessions
                .update_upstream_handle(key, upstream_handle.as_deref())
                .await;
            let messages = self.services.sessions.get_messages(key).await?;
            message_count = messages.len();
            if message_count == 2 {
                self.services.sessions.spawn_title_synthesis(key.clone());
            }
        }

        let spawned = self.dispatch_spawns(agent, req, &final_text).await;

        let denials = denials.lock().await.clone();
        Ok(ExecuteOutcome {
            success: true,
            response: final_text,
            error: None,
            session_id,
            message_count,
            spawned,
            duration_ms: started.elapsed().as_millis() as u64,
            tool_calls,
            permission_denials: denials,
            session_resume: resume_info,
        })
    }

    async fn finish_with_error(
        &self,
        agent: &AgentDefinition,
        _sink: &EventSink,
        session_key: &Option<crate::sessions::record::SessionKey>,
        resume_info: Option<ResumeInfo>,
        started: Instant,
        error: String,
    ) -> Result<ExecuteOutcome> {
        tracing::error!(agent = %agent.path, "execution failed: {}", error);
        if let Some(key) = session_key {
            let _ = self
                .services
                .sessions
                .add_message(key, Role::System, &format!("Error: {}", error))
                .await;
        }
        Ok(ExecuteOutcome {
            success: false,
            response: String::new(),
            error: Some(error),
            session_id: None,
            message_count: 0,
            spawned: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            tool_calls: Vec::new(),
            permission_denials: Vec::new(),
            session_resume: resume_info,
        })
    }

    async fn build_system_prompt(
        &self,
        agent: &AgentDefinition,
        initial_context: Option<&str>,
    ) -> String {
        let mut prompt = agent.system_prompt.clone();
        let mut remaining_tokens = SYSTEM_CONTEXT_TOKEN_BUDGET;

        for path in &agent.context_files {
            if remaining_tokens == 0 {
                tracing::debug!(agent = %agent.path, "context file budget exhausted");
                break;
            }
            match self.services.vault.read(path).await {
                Ok(content) => {
                    let tokens = crate::sessions::context::estimate_tokens(&content);
                    let included = if tokens > remaining_tokens {
                        let chars = remaining_tokens * 4;
                        let truncated: String = content.chars().take(chars).collect();
                        remaining_tokens = 0;
                        truncated
                    } else {
                        remaining_tokens -= tokens;
                        content
                    };
                    prompt.push_str(&format!("\n\n## Context: {}\n\n{}", path, included));
                }
                Err(e) => tracing::warn!(path = %path, "failed to read context file: {:#}", e),
            }
        }

        if let Some(extra) = initial_context {
            prompt.push_str(&format!("\n\n## Additional Context\n\n{}", extra));
        }
        prompt
    }

    /// Scan the final text for fenced `spawn` directives and enqueue the
    /// permitted ones at depth + 1.
    async fn dispatch_spawns(
        &self,
        agent: &AgentDefinition,
        req: &ExecuteRequest,
        text: &str,
    ) -> Vec<SpawnedChild> {
        let mut spawned = Vec::new();
        let spawn_matcher = agent.permissions.spawn_matcher();

        for caps in SPAWN_BLOCK.captures_iter(text) {
            let raw = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            let directive: SpawnDirective = match serde_json::from_str(raw) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(agent = %agent.path, "ignoring malformed spawn directive: {}", e);
                    continue;
                }
            };

            if !spawn_matcher.matches(&directive.agent) {
                tracing::warn!(
                    agent = %agent.path,
                    target = %directive.agent,
                    "spawn denied by permission policy"
                );
                continue;
            }

            let priority = directive.priority.unwrap_or_default();
            let context = ExecutionContext {
                message: Some(directive.message),
                document_path: directive.context.clone(),
                parent_agent: Some(agent.path.clone()),
                session_id: None,
            };

            match self
                .enqueue(
                    &directive.agent,
                    context,
                    priority,
                    req.depth + 1,
                    Some(agent.path.clone()),
                    None,
                )
                .await
            {
                Ok(queue_id) => {
                    tracing::info!(
                        parent = %agent.path,
                        child = %directive.agent,
                        queue_id = %queue_id,
                        depth = req.depth + 1,
                        "spawned child agent"
                    );
                    spawned.push(SpawnedChild {
                        agent_path: directive.agent,
                        queue_id,
                        priority,
                    });
                }
                Err(e) => match e.downcast_ref::<QueueError>() {
                    Some(QueueError::DepthExceeded { depth, max }) => {
                        tracing::warn!(
                            parent = %agent.path,
                            child = %directive.agent,
                            depth,
                            max,
                            "spawn dropped: depth limit reached"
                        );
                    }
                    _ => tracing::warn!(
                        parent = %agent.path,
                        child = %directive.agent,
                        "spawn failed: {:#}",
                        e
                    ),
                },
            }
        }

        spawned
    }

    // ------------------------------------------------------------------
    // Queue drain
    // ------------------------------------------------------------------

    async fn drain_once(self: &Arc<Self>) {
        loop {
            if self.in_flight.load(Ordering::SeqCst) >= self.config.max_concurrent {
                return;
            }
            let Some(item) = self.services.queue.next().await else {
                return;
            };
            if let Err(e) = self.services.queue.mark_running(&item.id).await {
                tracing::warn!(id = %item.id, "failed to claim queue item: {}", e);
                return;
            }

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                orchestrator.execute_queue_item(item).await;
                orchestrator.in_flight.fetch_sub(1, Ordering::SeqCst);
                orchestrator.nudge();
            });
        }
    }

    async fn execute_queue_item(self: &Arc<Self>, item: QueueItem) {
        tracing::info!(id = %item.id, agent = %item.agent_path, depth = item.depth, "queue item started");

        let req = ExecuteRequest {
            agent_path: item.agent_path.clone(),
            message: item
                .context
                .message
                .clone()
                .unwrap_or_else(|| "Carry out the task described in your instructions.".to_string()),
            scope: SessionScope {
                session_id: item.context.session_id.clone(),
                document_path: item.context.document_path.clone(),
            },
            initial_context: None,
            depth: item.depth,
        };

        let sink = EventSink {
            tx: None,
            bus: Some((Arc::clone(&self.services.events), item.id.clone())),
        };

        // The queue item carries an agent snapshot; run against it rather
        // than re-resolving, so in-flight work is immune to edits.
        let outcome = self.run_prepared(item.agent.clone(), req, sink).await;

        let queue_result = if outcome.success {
            self.services
                .queue
                .mark_completed(&item.id, outcome.response.clone())
                .await
        } else {
            self.services
                .queue
                .mark_failed(
                    &item.id,
                    outcome.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                )
                .await
        };
        if let Err(e) = queue_result {
            tracing::warn!(id = %item.id, "failed to finalize queue item: {}", e);
        }

        // Document-driven work reverts its entry so the next trigger can
        // fire; failures stay visible as `error`.
        if let Some(doc) = &item.context.document_path {
            let (status, extras) = if outcome.success {
                (AgentStatus::Pending, StatusExtras::completed(summarize(&outcome.response)))
            } else {
                (
                    AgentStatus::Error,
                    StatusExtras::failed(outcome.error.clone().unwrap_or_default()),
                )
            };
            if let Err(e) = self
                .services
                .scanner
                .update_status(doc, &item.agent_path, status, extras)
                .await
            {
                tracing::warn!(doc = %doc, agent = %item.agent_path, "failed to update document status: {:#}", e);
            }
        }

        self.services
            .events
            .close_after(item.id.clone(), STREAM_LINGER);
        tracing::info!(id = %item.id, success = outcome.success, "queue item finished");
    }

    // ------------------------------------------------------------------
    // Trigger evaluation
    // ------------------------------------------------------------------

    /// One trigger pass: promote due entries to `needs_run`, then claim
    /// everything in `needs_run` and enqueue it.
    pub async fn run_trigger_pass(&self) -> TriggerPassReport {
        let mut report = TriggerPassReport::default();

        let due = match self.services.scanner.find_triggered().await {
            Ok(due) => due,
            Err(e) => {
                tracing::warn!("trigger scan failed: {:#}", e);
                return report;
            }
        };
        for (doc, entry) in due {
            match self
                .services
                .scanner
                .update_status(&doc, &entry.agent, AgentStatus::NeedsRun, StatusExtras::default())
                .await
            {
                Ok(()) => report.promoted += 1,
                Err(e) => tracing::warn!(doc = %doc, agent = %entry.agent, "failed to promote entry: {:#}", e),
            }
        }

        report.enqueued = self.enqueue_needs_run(None).await;
        report
    }

    /// Promote and run a single document's agents on explicit request.
    pub async fn run_document(&self, doc: &str, agents: Option<&[String]>) -> Result<TriggerPassReport> {
        let promoted = match agents {
            Some(list) => self.services.scanner.trigger(doc, list).await?,
            None => self.services.scanner.trigger_all(doc).await?,
        };
        let enqueued = self.enqueue_needs_run(Some(doc)).await;
        Ok(TriggerPassReport { promoted, enqueued })
    }

    /// Advance `on_save` entries for a document, then run them.
    pub async fn trigger_on_save(&self, doc: &str) -> Result<TriggerPassReport> {
        let promoted = self.services.scanner.trigger_on_save(doc).await?;
        let enqueued = self.enqueue_needs_run(Some(doc)).await;
        Ok(TriggerPassReport { promoted, enqueued })
    }

    /// Claim `needs_run` entries (optionally scoped to one document):
    /// durably mark them `running`, then enqueue.
    async fn enqueue_needs_run(&self, only_doc: Option<&str>) -> usize {
        let needs_run = match self.services.scanner.find_needs_run().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("needs_run scan failed: {:#}", e);
                return 0;
            }
        };

        let mut enqueued = 0usize;
        for (doc, entry) in needs_run {
            if only_doc.is_some_and(|d| d != doc) {
                continue;
            }
            // Status goes durable before the queue sees the work.
            if let Err(e) = self
                .services
                .scanner
                .update_status(&doc, &entry.agent, AgentStatus::Running, StatusExtras::default())
                .await
            {
                tracing::warn!(doc = %doc, agent = %entry.agent, "failed to mark entry running: {:#}", e);
                continue;
            }

            let context = ExecutionContext {
                message: None,
                document_path: Some(doc.clone()),
                parent_agent: None,
                session_id: None,
            };
            match self
                .enqueue(&entry.agent, context, Priority::Normal, 0, None, None)
                .await
            {
                Ok(_) => enqueued += 1,
                Err(e) => {
                    tracing::warn!(doc = %doc, agent = %entry.agent, "failed to enqueue triggered work: {:#}", e);
                    let _ = self
                        .services
                        .scanner
                        .update_status(
                            &doc,
                            &entry.agent,
                            AgentStatus::Error,
                            StatusExtras::failed(format!("enqueue failed: {e:#}")),
                        )
                        .await;
                }
            }
        }
        enqueued
    }

    // ------------------------------------------------------------------
    // Background loops and lifecycle
    // ------------------------------------------------------------------

    /// Spawn the drain, trigger, session-cleanup, and permission-sweep
    /// loops. Handles terminate on shutdown.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        // Drain loop: poll every 5 s, plus nudges on enqueue/completion.
        let orchestrator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(DRAIN_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = orchestrator.drain_nudge.notified() => {}
                    _ = shutdown.changed() => break,
                }
                if !orchestrator.accepting.load(Ordering::SeqCst) {
                    break;
                }
                orchestrator.drain_once().await;
            }
            tracing::debug!("drain loop stopped");
        }));

        // Trigger loop: one-shot soon after boot, then every minute.
        let orchestrator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(TRIGGER_BOOT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
            let mut interval = tokio::time::interval(TRIGGER_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let report = orchestrator.run_trigger_pass().await;
                if report.promoted > 0 || report.enqueued > 0 {
                    tracing::info!(
                        promoted = report.promoted,
                        enqueued = report.enqueued,
                        "trigger pass"
                    );
                }
            }
            tracing::debug!("trigger loop stopped");
        }));

        // Session cleanup loop.
        let orchestrator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(MAINTENANCE_BOOT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
            let mut interval = tokio::time::interval(SESSION_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                orchestrator.services.sessions.evict_stale().await;
                if let Err(e) = orchestrator
                    .services
                    .sessions
                    .cleanup(SESSION_MAX_AGE_DAYS)
                    .await
                {
                    tracing::warn!("session cleanup failed: {:#}", e);
                }
            }
            tracing::debug!("session cleanup loop stopped");
        }));

        // Permission sweep loop.
        let orchestrator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(MAINTENANCE_BOOT_DELAY) => {}
                _ = shutdown.changed() => return,
            }
            let mut interval = tokio::time::interval(PERMISSION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                orchestrator.services.broker.sweep().await;
            }
            tracing::debug!("permission sweep loop stopped");
        }));

        handles
    }

    /// Stop accepting work, wait out in-flight executions up to `grace`,
    /// and persist dirty state.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("shutting down: draining in-flight executions");
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        let leftover = self.in_flight.load(Ordering::SeqCst);
        if leftover > 0 {
            tracing::warn!(leftover, "forcing shutdown with executions still in flight");
        }
        self.services.queue.save().await;
        tracing::info!("shutdown complete");
    }
}

fn summarize(text: &str) -> String {
    const MAX: usize = 200;
    let first_line = text.lines().next().unwrap_or("").trim();
    if first_line.chars().count() <= MAX {
        first_line.to_string()
    } else {
        first_line.chars().take(MAX).collect()
    }
}

/// Build the standard service set over a vault root.
pub fn build_services(
    vault: Arc<Vault>,
    llm: Option<Arc<dyn LlmClient>>,
    max_spawn_depth: u32,
) -> OrchestratorServices {
    let queue_path = vault.root().join(".queue/queue.json");
    OrchestratorServices {
        agents: Arc::new(AgentLoader::new(Arc::clone(&vault))),
        queue: Arc::new(ExecutionQueue::new(max_spawn_depth, Some(queue_path))),
        sessions: Arc::new(SessionStore::new(vault.root(), llm.clone())),
        scanner: Arc::new(DocumentScanner::new(Arc::clone(&vault))),
        broker: Arc::new(PermissionBroker::default()),
        events: Arc::new(EventBus::new()),
        vault,
        llm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_tracker_extracts_suffixes() {
        let mut tracker = DeltaTracker::default();
        assert_eq!(tracker.push("Hel"), "Hel");
        assert_eq!(tracker.push("Hello"), "lo");
        assert_eq!(tracker.push("Hello"), "");
        // A non-prefix restart is treated as a new message.
        assert_eq!(tracker.push("Fresh"), "Fresh");
    }

    #[test]
    fn spawn_block_regex_extracts_json() {
        let text = "Done.\n\n```spawn\n{\"agent\": \"agents/b.md\", \"message\": \"go\"}\n```\n\ntail";
        let caps: Vec<_> = SPAWN_BLOCK.captures_iter(text).collect();
        assert_eq!(caps.len(), 1);
        let directive: SpawnDirective =
            serde_json::from_str(caps[0].get(1).unwrap().as_str().trim()).unwrap();
        assert_eq!(directive.agent, "agents/b.md");
        assert_eq!(directive.message, "go");
        assert_eq!(directive.priority, None);
    }

    #[test]
    fn summarize_takes_first_line() {
        assert_eq!(summarize("first\nsecond"), "first");
        let long = "x".repeat(500);
        assert_eq!(summarize(&long).chars().count(), 200);
    }
}
