//! Execution-context builder.
//!
//! Decides, per message, how prior conversation state reaches the model:
//! resume the upstream session when a valid handle exists, synthesize a
//! prompt prefix from stored history when it does not, or pass the message
//! through untouched for a fresh conversation.

use serde::Serialize;

use super::record::{Role, Session};

/// Default context-injection budget, estimated at 4 chars per token.
pub const DEFAULT_TOKEN_BUDGET: usize = 50_000;
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMethod {
    New,
    SdkResume,
    ContextInjection,
}

/// Where the session record came from when this execution started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Cache,
    Disk,
    New,
}

/// Diagnostic record surfaced in responses as `sessionResume`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInfo {
    pub method: ResumeMethod,
    pub messages_injected: usize,
    pub token_estimate: usize,
    pub previous_message_count: usize,
    pub source: SessionSource,
}

/// The prompt to send plus how the decision was made.
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub prompt: String,
    /// Upstream handle to pass as `resume`, when method is `SdkResume`.
    pub resume: Option<String>,
    pub info: ResumeInfo,
}

/// Build the prompt for one user message against a session's state.
pub fn build_execution_context(
    session: &Session,
    user_message: &str,
    source: SessionSource,
    token_budget: usize,
) -> PreparedPrompt {
    let previous_message_count = session.messages.len();

    if let Some(handle) = &session.upstream_session_id {
        return PreparedPrompt {
            prompt: user_message.to_string(),
            resume: Some(handle.clone()),
            info: ResumeInfo {
                method: ResumeMethod::SdkResume,
                messages_injected: 0,
                token_estimate: estimate_tokens(user_message),
                previous_message_count,
                source,
            },
        };
    }

    if previous_message_count == 0 {
        return PreparedPrompt {
            prompt: user_message.to_string(),
            resume: None,
            info: ResumeInfo {
                method: ResumeMethod::New,
                messages_injected: 0,
                token_estimate: estimate_tokens(user_message),
                previous_message_count,
                source,
            },
        };
    }

    // No handle but history exists: inject the most recent messages that
    // fit the budget, newest first, skipping system markers.
    let mut selected: Vec<&super::record::Message> = Vec::new();
    let mut used_tokens = estimate_tokens(user_message);
    let mut skipped_for_budget = 0usize;
    let mut budget_exhausted = false;

    for message in session.messages.iter().rev() {
        if message.role == Role::System {
            continue;
        }
        if budget_exhausted {
            skipped_for_budget += 1;
            continue;
        }
        let cost = estimate_tokens(&message.content) + 8;
        if used_tokens + cost > token_budget {
            // Accumulation stops at the first overflow so the injected
            // window stays contiguous.
            budget_exhausted = true;
            skipped_for_budget += 1;
            continue;
        }
        used_tokens += cost;
        selected.push(message);
    }
    selected.reverse();

    let mut history = String::new();
    if skipped_for_budget > 0 {
        history.push_str(&format!(
            "[{} earlier messages omitted for context limits]\n\n",
            skipped_for_budget
        ));
    }
    for message in &selected {
        history.push_str(&format!(
            "{}: {}\n\n",
            message.role.header_name(),
            message.content
        ));
    }

    let prompt = format!(
        "## Previous Conversation\n\n{}---\n\n## Current Message\n\n{}",
        history, user_message
    );
    let token_estimate = estimate_tokens(&prompt);

    PreparedPrompt {
        prompt,
        resume: None,
        info: ResumeInfo {
            method: ResumeMethod::ContextInjection,
            messages_injected: selected.len(),
            token_estimate,
            previous_message_count,
            source,
        },
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}
