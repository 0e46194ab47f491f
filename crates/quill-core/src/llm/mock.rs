//! Scripted stand-in for a real LLM client.
//!
//! Used by tests and by `QUILL_MOCK_LLM=1` development runs. Each query
//! pops the next scripted turn and replays it as a streaming event
//! sequence: init, growing assistant prefixes, tool uses (running each
//! through the approval callback), then completion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ApprovalDecision, LlmClient, LlmError, LlmEvent, QueryOptions, ToolUse};

/// One scripted model turn.
#[derive(Debug, Clone)]
pub struct MockTurn {
    pub text: String,
    pub tool_uses: Vec<ToolUse>,
    /// Upstream session id reported by init/completion.
    pub session_id: Option<String>,
}

impl MockTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_uses: Vec::new(),
            session_id: Some("mock-upstream-1".to_string()),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_tool_use(mut self, tool_use: ToolUse) -> Self {
        self.tool_uses.push(tool_use);
        self
    }
}

/// A recorded query, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub prompt: String,
    pub resume: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Default)]
pub struct MockLlm {
    turns: Mutex<VecDeque<MockTurn>>,
    recorded: Mutex<Vec<RecordedQuery>>,
    reject_resume: AtomicBool,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_turns(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            ..Self::default()
        }
    }

    pub fn push_turn(&self, turn: MockTurn) {
        self.turns.lock().unwrap().push_back(turn);
    }

    /// Make the next queries fail resume attempts, simulating a lost
    /// upstream session.
    pub fn set_reject_resume(&self, reject: bool) {
        self.reject_resume.store(reject, Ordering::SeqCst);
    }

    pub fn recorded_queries(&self) -> Vec<RecordedQuery> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn query(
        &self,
        prompt: String,
        options: QueryOptions,
    ) -> Result<mpsc::Receiver<LlmEvent>, LlmError> {
        if options.resume.is_some() && self.reject_resume.load(Ordering::SeqCst) {
            return Err(LlmError::ResumeUnavailable);
        }

        self.recorded.lock().unwrap().push(RecordedQuery {
            prompt: prompt.clone(),
            resume: options.resume.clone(),
            system_prompt: options.system_prompt.clone(),
        });

        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockTurn::text(format!("echo: {}", prompt)));

        let (tx, rx) = mpsc::channel(32);
        let approval = options.approval.clone();

        tokio::spawn(async move {
            let _ = tx
                .send(LlmEvent::Init {
                    session_id: turn.session_id.clone(),
                    model: Some("mock".to_string()),
                })
                .await;

            for tool_use in &turn.tool_uses {
                if let Some(approve) = &approval {
                    // The decision shapes what a real client would feed
                    // back to the model; the mock only drives the callback.
                    let decision = approve(tool_use.clone()).await;
                    if let ApprovalDecision::Deny { message } = decision {
                        tracing::debug!(tool = %tool_use.name, "mock tool denied: {}", message);
                    }
                }
                let _ = tx.send(LlmEvent::ToolUse(tool_use.clone())).await;
            }

            // Replay the text as growing prefixes so consumers exercise
            // delta extraction.
            for prefix in growing_prefixes(&turn.text) {
                let _ = tx.send(LlmEvent::Assistant { text: prefix }).await;
            }

            let _ = tx
                .send(LlmEvent::Completed {
                    text: turn.text.clone(),
                    session_id: turn.session_id.clone(),
                })
                .await;
        });

        Ok(rx)
    }
}

fn growing_prefixes(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    let step = (chars.len() / 3).max(1);
    let mut prefixes = Vec::new();
    let mut end = step;
    while end < chars.len() {
        prefixes.push(chars[..end].iter().collect());
        end += step;
    }
    prefixes.push(text.to_string());
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn streams_growing_prefixes_then_completes() {
        let llm = MockLlm::with_turns(vec![MockTurn::text("hello world")]);
        let mut rx = llm
            .query("hi".to_string(), QueryOptions::default())
            .await
            .unwrap();

        let mut last_len = 0;
        let mut completed = None;
        while let Some(event) = rx.recv().await {
            match event {
                LlmEvent::Assistant { text } => {
                    assert!(text.len() >= last_len, "prefixes must grow");
                    assert!("hello world".starts_with(&text));
                    last_len = text.len();
                }
                LlmEvent::Completed { text, .. } => completed = Some(text),
                _ => {}
            }
        }
        assert_eq!(completed.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn rejects_resume_when_configured() {
        let llm = MockLlm::new();
        llm.set_reject_resume(true);
        let options = QueryOptions {
            resume: Some("stale-handle".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            llm.query("hi".to_string(), options).await,
            Err(LlmError::ResumeUnavailable)
        ));

        // Without a resume handle the same query succeeds.
        assert!(llm
            .query("hi".to_string(), QueryOptions::default())
            .await
            .is_ok());
    }
}
