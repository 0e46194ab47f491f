//! Typed publish/subscribe streams.
//!
//! One broadcast topic per queue item id, created on demand by whichever
//! side shows up first (subscriber or executing code) and torn down a few
//! seconds after the terminal event so late subscribers can still observe
//! the outcome. The singleton permission stream lives on the broker; this
//! bus only carries execution streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::sessions::context::ResumeInfo;

const TOPIC_BUFFER: usize = 256;
/// Grace window between the terminal event and topic teardown.
pub const STREAM_LINGER: Duration = Duration::from_secs(5);

/// Events carried on chat and per-queue-item streams.
///
/// For a successful run the sequence is: one `session`, zero or more
/// `init`, any number of `text`/`tool_use`, then one `done` — or one
/// `error` at any point. Queue streams additionally open with `connected`
/// and end with `close`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Session {
        session_id: Option<String>,
        resume: Option<ResumeInfo>,
    },
    Connected {
        item: serde_json::Value,
    },
    Init {
        model: Option<String>,
    },
    Text {
        content: String,
        delta: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Done {
        #[serde(flatten)]
        result: serde_json::Value,
    },
    Error {
        error: String,
    },
    Close,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, creating it when absent.
    pub async fn subscribe(&self, key: &str) -> broadcast::Receiver<StreamEvent> {
        let mut topics = self.topics.write().await;
        topics
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .subscribe()
    }

    /// Publish to a topic, creating it when absent so events emitted
    /// before the first subscriber are not lost to later ones within the
    /// same topic lifetime.
    pub async fn publish(&self, key: &str, event: StreamEvent) {
        let mut topics = self.topics.write().await;
        let sender = topics
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0);
        // No subscribers is not an error.
        let _ = sender.send(event);
    }

    /// Emit `close` and remove the topic after the linger window.
    pub fn close_after(self: &Arc<Self>, key: String, delay: Duration) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.publish(&key, StreamEvent::Close).await;
            bus.topics.write().await.remove(&key);
        });
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}
