//! The LLM client seam.
//!
//! The orchestrator does not speak to a model provider directly; it relies
//! on an injected [`LlmClient`] that exposes one streaming query primitive.
//! Each call yields a finite sequence of typed events over a channel, and
//! the caller supplies a tool-approval callback through [`QueryOptions`].

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;

/// A tool invocation surfaced by the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Outcome of a tool-approval callback.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Allow {
        /// Optionally rewritten tool input.
        updated_input: Option<serde_json::Value>,
    },
    Deny {
        /// Message shown to the model in place of the tool result.
        message: String,
    },
}

pub type ApprovalFuture = BoxFuture<'static, ApprovalDecision>;

/// Callback invoked before every write-class tool execution.
pub type ApprovalCallback = Arc<dyn Fn(ToolUse) -> ApprovalFuture + Send + Sync>;

/// Options for one streaming query.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Explicit tool whitelist; `None` leaves the client's default set.
    pub allowed_tools: Option<Vec<String>>,
    /// Upstream session handle to re-attach to, when one is known.
    pub resume: Option<String>,
    pub approval: Option<ApprovalCallback>,
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("model", &self.model)
            .field("resume", &self.resume)
            .field("allowed_tools", &self.allowed_tools)
            .field("has_approval", &self.approval.is_some())
            .finish()
    }
}

/// One event from a streaming query.
///
/// `Assistant` events carry the message text as a growing prefix; the
/// consumer derives deltas by diffing against the previous event.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// The client initialized a conversation upstream.
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    Assistant {
        text: String,
    },
    ToolUse(ToolUse),
    /// Terminal success. `text` is the full final assistant text.
    Completed {
        text: String,
        session_id: Option<String>,
    },
    /// Terminal failure.
    Failed {
        error: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The upstream session named by `resume` no longer exists. The caller
    /// should drop the handle and fall back to context injection.
    #[error("upstream session is no longer available")]
    ResumeUnavailable,

    #[error("{0}")]
    Other(String),
}

/// A client able to run one streaming query against a model.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn query(
        &self,
        prompt: String,
        options: QueryOptions,
    ) -> Result<mpsc::Receiver<LlmEvent>, LlmError>;
}

/// Drain a query to completion and return the final text.
///
/// Convenience for callers that do not care about streaming, e.g. title
/// synthesis.
pub async fn collect_text(
    client: &dyn LlmClient,
    prompt: String,
    options: QueryOptions,
) -> Result<String, LlmError> {
    let mut rx = client.query(prompt, options).await?;
    let mut last = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            LlmEvent::Assistant { text } => last = text,
            LlmEvent::Completed { text, .. } => return Ok(text),
            LlmEvent::Failed { error } => return Err(LlmError::Other(error)),
            _ => {}
        }
    }
    Ok(last)
}
