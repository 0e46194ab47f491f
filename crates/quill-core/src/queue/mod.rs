//! Execution queue.
//!
//! Bounded FIFO-per-priority store of pending work. State transitions are
//! checked; terminal items are retained for inspection and pruned oldest
//! first. Every mutation snapshots to disk on a best-effort basis — a
//! failed save never fails the transition.

use std::collections::VecDeque;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::agents::AgentDefinition;

const DEFAULT_CAPACITY: usize = 100;
const DEFAULT_TERMINAL_RETENTION: usize = 50;

/// Why an enqueue or transition was rejected.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full ({0} pending items)")]
    Full(usize),

    #[error("invalid transition from {from} to {to} for item {id}")]
    InvalidTransition {
        id: String,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("spawn depth {depth} reaches the configured maximum {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("unknown queue item: {0}")]
    Unknown(String),
}

/// Scheduling priority. Higher runs first; FIFO within a level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What an execution runs against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionContext {
    /// User message, when the work originated from a chat or spawn.
    pub message: Option<String>,
    /// Target document for document-bound agents.
    pub document_path: Option<String>,
    /// Name/path of the agent that spawned this work.
    pub parent_agent: Option<String>,
    /// Client-supplied session discriminator.
    pub session_id: Option<String>,
}

/// One unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub agent_path: String,
    /// Definition snapshot taken at enqueue time.
    pub agent: AgentDefinition,
    pub context: ExecutionContext,
    pub priority: Priority,
    pub depth: u32,
    #[serde(default)]
    pub spawned_by: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ItemStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Parameters for [`ExecutionQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub agent: AgentDefinition,
    pub context: ExecutionContext,
    pub priority: Priority,
    pub depth: u32,
    pub spawned_by: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Snapshot grouped by state for the API.
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub pending: Vec<QueueItem>,
    pub running: Vec<QueueItem>,
    pub completed: Vec<QueueItem>,
}

struct Inner {
    items: VecDeque<QueueItem>,
}

/// The queue itself. Cheap to share behind an `Arc`.
pub struct ExecutionQueue {
    inner: RwLock<Inner>,
    capacity: usize,
    terminal_retention: usize,
    max_depth: u32,
    persist_path: Option<PathBuf>,
}

impl ExecutionQueue {
    pub fn new(max_depth: u32, persist_path: Option<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: VecDeque::new(),
            }),
            capacity: DEFAULT_CAPACITY,
            terminal_retention: DEFAULT_TERMINAL_RETENTION,
            max_depth,
            persist_path,
        }
    }

    #[cfg(test)]
    fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Rebuild the snapshot from disk. Items persisted in the running
    /// state are dropped: the execution that owned them died with the
    /// previous process.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let Some(path) = &self.persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let items: Vec<QueueItem> = serde_json::from_str(&raw)?;
        let mut inner = self.inner.write().await;
        let mut restored = 0usize;
        for item in items {
            if item.status == ItemStatus::Running {
                tracing::warn!(id = %item.id, agent = %item.agent_path, "dropping orphaned running item from persisted queue");
                continue;
            }
            inner.items.push_back(item);
            restored += 1;
        }
        Ok(restored)
    }

    /// Add work. Fails when the pending backlog is at capacity or the
    /// depth reaches the configured maximum.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<String, QueueError> {
        if req.depth >= self.max_depth {
            return Err(QueueError::DepthExceeded {
                depth: req.depth,
                max: self.max_depth,
            });
        }

        let mut inner = self.inner.write().await;
        let pending = inner
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .count();
        if pending >= self.capacity {
            return Err(QueueError::Full(pending));
        }

        let item = QueueItem {
            id: uuid::Uuid::new_v4().to_string(),
            agent_path: req.agent.path.clone(),
            agent: req.agent,
            context: req.context,
            priority: req.priority,
            depth: req.depth,
            spawned_by: req.spawned_by,
            scheduled_for: req.scheduled_for,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: ItemStatus::Pending,
            result: None,
            error: None,
        };
        let id = item.id.clone();
        inner.items.push_back(item);
        self.persist(&inner).await;
        Ok(id)
    }

    /// The highest-priority pending item whose schedule is due, FIFO
    /// within a priority level. Does not claim it.
    pub async fn next(&self) -> Option<QueueItem> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        inner
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Pending)
            .filter(|i| i.scheduled_for.map_or(true, |at| at <= now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.created_at.cmp(&a.created_at))
            })
            .cloned()
    }

    pub async fn mark_running(&self, id: &str) -> Result<(), QueueError> {
        self.transition(id, ItemStatus::Running, None, None).await
    }

    pub async fn mark_completed(&self, id: &str, result: String) -> Result<(), QueueError> {
        self.transition(id, ItemStatus::Completed, Some(result), None)
            .await
    }

    pub async fn mark_failed(&self, id: &str, error: String) -> Result<(), QueueError> {
        self.transition(id, ItemStatus::Failed, None, Some(error))
            .await
    }

    async fn transition(
        &self,
        id: &str,
        to: ItemStatus,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.write().await;
        let item = inner
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| QueueError::Unknown(id.to_string()))?;

        let valid = matches!(
            (item.status, to),
            (ItemStatus::Pending, ItemStatus::Running)
                | (ItemStatus::Running, ItemStatus::Completed)
                | (ItemStatus::Running, ItemStatus::Failed)
        );
        if !valid {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: item.status,
                to,
            });
        }

        item.status = to;
        match to {
            ItemStatus::Running => item.started_at = Some(Utc::now()),
            ItemStatus::Completed | ItemStatus::Failed => {
                item.completed_at = Some(Utc::now());
                item.result = result;
                item.error = error;
            }
            ItemStatus::Pending => unreachable!(),
        }

        self.prune_terminal(&mut inner);
        self.persist(&inner).await;
        Ok(())
    }

    pub async fn has_pending(&self) -> bool {
        let inner = self.inner.read().await;
        inner.items.iter().any(|i| i.status == ItemStatus::Pending)
    }

    pub async fn running_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Running)
            .count()
    }

    pub async fn get(&self, id: &str) -> Option<QueueItem> {
        let inner = self.inner.read().await;
        inner.items.iter().find(|i| i.id == id).cloned()
    }

    /// Snapshot grouped by state. Terminal items (completed and failed)
    /// land in `completed`, newest last.
    pub async fn get_state(&self) -> QueueState {
        let inner = self.inner.read().await;
        let mut state = QueueState {
            pending: Vec::new(),
            running: Vec::new(),
            completed: Vec::new(),
        };
        for item in &inner.items {
            match item.status {
                ItemStatus::Pending => state.pending.push(item.clone()),
                ItemStatus::Running => state.running.push(item.clone()),
                ItemStatus::Completed | ItemStatus::Failed => state.completed.push(item.clone()),
            }
        }
        state
    }

    /// Persist the full snapshot now, e.g. at shutdown.
    pub async fn save(&self) {
        let inner = self.inner.read().await;
        self.persist(&inner).await;
    }

    fn prune_terminal(&self, inner: &mut Inner) {
        let terminal = inner.items.iter().filter(|i| i.status.is_terminal()).count();
        let mut excess = terminal.saturating_sub(self.terminal_retention);
        if excess == 0 {
            return;
        }
        // Oldest first: items sit in insertion order.
        inner.items.retain(|i| {
            if excess > 0 && i.status.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    async fn persist(&self, inner: &Inner) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let items: Vec<&QueueItem> = inner.items.iter().collect();
        let json = match serde_json::to_string_pretty(&items) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("failed to serialize queue snapshot: {}", e);
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!("failed to create queue directory: {}", e);
                return;
            }
        }
        if let Err(e) = tokio::fs::write(path, json).await {
            tracing::warn!("failed to persist queue to {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;

    fn agent(path: &str) -> AgentDefinition {
        AgentDefinition {
            path: path.to_string(),
            name: "test".to_string(),
            description: None,
            kind: AgentKind::Standalone,
            model: None,
            tools: None,
            permissions: Default::default(),
            max_spawn_depth: None,
            context_files: Vec::new(),
            services: Vec::new(),
            system_prompt: String::new(),
        }
    }

    fn request(path: &str, priority: Priority, depth: u32) -> EnqueueRequest {
        EnqueueRequest {
            agent: agent(path),
            context: ExecutionContext::default(),
            priority,
            depth,
            spawned_by: None,
            scheduled_for: None,
        }
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let queue = ExecutionQueue::new(3, None);
        let low = queue
            .enqueue(request("agents/a", Priority::Low, 0))
            .await
            .unwrap();
        let first_normal = queue
            .enqueue(request("agents/b", Priority::Normal, 0))
            .await
            .unwrap();
        let _second_normal = queue
            .enqueue(request("agents/c", Priority::Normal, 0))
            .await
            .unwrap();
        let high = queue
            .enqueue(request("agents/d", Priority::High, 0))
            .await
            .unwrap();

        assert_eq!(queue.next().await.unwrap().id, high);
        queue.mark_running(&high).await.unwrap();
        queue.mark_completed(&high, "ok".into()).await.unwrap();

        assert_eq!(queue.next().await.unwrap().id, first_normal);
        queue.mark_running(&first_normal).await.unwrap();
        queue.mark_failed(&first_normal, "boom".into()).await.unwrap();

        queue.mark_running(&queue.next().await.unwrap().id).await.unwrap();
        let remaining = queue.next().await.unwrap();
        assert_eq!(remaining.id, low);
    }

    #[tokio::test]
    async fn rejects_invalid_transitions() {
        let queue = ExecutionQueue::new(3, None);
        let id = queue
            .enqueue(request("agents/a", Priority::Normal, 0))
            .await
            .unwrap();

        // pending -> completed skips running
        assert!(matches!(
            queue.mark_completed(&id, "x".into()).await,
            Err(QueueError::InvalidTransition { .. })
        ));

        queue.mark_running(&id).await.unwrap();
        queue.mark_completed(&id, "done".into()).await.unwrap();

        // terminal items stay terminal
        assert!(matches!(
            queue.mark_running(&id).await,
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(matches!(
            queue.mark_failed(&id, "again".into()).await,
            Err(QueueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn capacity_and_depth_limits() {
        let queue = ExecutionQueue::new(2, None).with_capacity(2);
        queue
            .enqueue(request("agents/a", Priority::Normal, 0))
            .await
            .unwrap();
        queue
            .enqueue(request("agents/b", Priority::Normal, 0))
            .await
            .unwrap();
        assert!(matches!(
            queue.enqueue(request("agents/c", Priority::Normal, 0)).await,
            Err(QueueError::Full(2))
        ));

        assert!(matches!(
            queue.enqueue(request("agents/d", Priority::Normal, 2)).await,
            Err(QueueError::DepthExceeded { depth: 2, max: 2 })
        ));
    }

    #[tokio::test]
    async fn scheduled_items_wait_for_their_time() {
        let queue = ExecutionQueue::new(2, None);
        let mut req = request("agents/a", Priority::High, 0);
        req.scheduled_for = Some(Utc::now() + chrono::Duration::hours(1));
        queue.enqueue(req).await.unwrap();
        let due = queue
            .enqueue(request("agents/b", Priority::Low, 0))
            .await
            .unwrap();

        // The future high-priority item is skipped in favor of due work.
        assert_eq!(queue.next().await.unwrap().id, due);
    }

    #[tokio::test]
    async fn persistence_drops_running_items() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let queue = ExecutionQueue::new(2, Some(path.clone()));
        let done = queue
            .enqueue(request("agents/a", Priority::Normal, 0))
            .await
            .unwrap();
        let running = queue
            .enqueue(request("agents/b", Priority::Normal, 0))
            .await
            .unwrap();
        let pending = queue
            .enqueue(request("agents/c", Priority::Normal, 0))
            .await
            .unwrap();

        queue.mark_running(&done).await.unwrap();
        queue.mark_completed(&done, "ok".into()).await.unwrap();
        queue.mark_running(&running).await.unwrap();

        let reloaded = ExecutionQueue::new(2, Some(path));
        let restored = reloaded.load().await.unwrap();
        assert_eq!(restored, 2);
        assert!(reloaded.get(&running).await.is_none());
        assert!(reloaded.get(&pending).await.is_some());
        assert_eq!(
            reloaded.get(&done).await.unwrap().status,
            ItemStatus::Completed
        );
    }

    #[tokio::test]
    async fn terminal_retention_prunes_oldest() {
        let mut queue = ExecutionQueue::new(2, None);
        queue.terminal_retention = 2;
        let mut ids = Vec::new();
        for i in 0..4 {
            let id = queue
                .enqueue(request(&format!("agents/{i}"), Priority::Normal, 0))
                .await
                .unwrap();
            queue.mark_running(&id).await.unwrap();
            queue.mark_completed(&id, "ok".into()).await.unwrap();
            ids.push(id);
        }
        let state = queue.get_state().await;
        assert_eq!(state.completed.len(), 2);
        assert!(queue.get(&ids[0]).await.is_none());
        assert!(queue.get(&ids[3]).await.is_some());
    }
}
