//! Session and message records.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::{AgentDefinition, AgentKind};

/// Sentinel prefix left behind by a historical serialization defect: a
/// non-string handle stringified upstream arrives as `[object Object]`.
/// Anything carrying the prefix is treated as corrupt.
const CORRUPT_HANDLE_PREFIX: &str = "[object";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Capitalized form used in session file headers.
    pub fn header_name(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::System => "System",
        }
    }

    pub fn from_header_name(name: &str) -> Option<Self> {
        match name {
            "User" => Some(Role::User),
            "Assistant" => Some(Role::Assistant),
            "System" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// What a session is keyed by: the agent plus a context discriminator.
///
/// The discriminator is the client session id for conversational agents,
/// the target document path for document-bound agents, and `"default"`
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub agent_path: String,
    pub discriminator: String,
}

impl SessionKey {
    pub const DEFAULT_DISCRIMINATOR: &'static str = "default";

    pub fn new(agent_path: impl Into<String>, discriminator: impl Into<String>) -> Self {
        Self {
            agent_path: agent_path.into(),
            discriminator: discriminator.into(),
        }
    }

    /// Encoded form used in session file front matter.
    pub fn encode(&self) -> String {
        format!("{}#{}", self.agent_path, self.discriminator)
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let (agent_path, discriminator) = encoded.split_once('#')?;
        Some(Self::new(agent_path, discriminator))
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Request-scoped context that selects a session.
#[derive(Debug, Clone, Default)]
pub struct SessionScope {
    pub session_id: Option<String>,
    pub document_path: Option<String>,
}

impl SessionScope {
    /// Derive the session key for an agent under this scope.
    pub fn key_for(&self, agent: &AgentDefinition) -> SessionKey {
        let discriminator = match agent.kind {
            AgentKind::Chatbot => self.session_id.clone(),
            AgentKind::Document => self.document_path.clone(),
            AgentKind::Standalone => None,
        };
        SessionKey::new(
            agent.path.clone(),
            discriminator.unwrap_or_else(|| SessionKey::DEFAULT_DISCRIMINATOR.to_string()),
        )
    }
}

/// A full conversation record. The on-disk text file is the source of
/// truth; this struct is the loaded view.
#[derive(Debug, Clone)]
pub struct Session {
    /// Stable opaque id for external reference.
    pub id: String,
    pub key: SessionKey,
    pub agent_path: String,
    pub agent_name: String,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    /// Validated upstream-LLM session handle. Never an empty or corrupt
    /// string; see [`normalize_upstream_handle`].
    pub upstream_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub archived: bool,
    /// Opaque context map (target document path, client session id, ...).
    pub context: Option<serde_json::Value>,
    /// Absolute path of the backing file.
    pub file_path: PathBuf,
}

impl Session {
    pub fn append(&mut self, role: Role, content: impl Into<String>) -> &Message {
        self.messages.push(Message {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        });
        self.last_accessed = Utc::now();
        self.messages.last().expect("just pushed")
    }
}

/// Validate a candidate upstream handle, normalizing anything invalid to
/// absent.
///
/// Earlier defects wrote stringified objects into front matter, so the
/// check runs on both read and write boundaries.
pub fn normalize_upstream_handle(candidate: Option<&str>) -> Option<String> {
    let handle = candidate?.trim();
    if handle.is_empty() || handle.starts_with(CORRUPT_HANDLE_PREFIX) {
        return None;
    }
    Some(handle.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_validation_rejects_corrupt_values() {
        assert_eq!(normalize_upstream_handle(None), None);
        assert_eq!(normalize_upstream_handle(Some("")), None);
        assert_eq!(normalize_upstream_handle(Some("   ")), None);
        assert_eq!(normalize_upstream_handle(Some("[object Object]")), None);
        assert_eq!(normalize_upstream_handle(Some("[object Promise]")), None);
        assert_eq!(
            normalize_upstream_handle(Some("sess_abc123")),
            Some("sess_abc123".to_string())
        );
    }

    #[test]
    fn key_encode_round_trip() {
        let key = SessionKey::new("agents/helper.md", "s1");
        let decoded = SessionKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn scope_picks_discriminator_by_kind() {
        let mut agent = AgentDefinition {
            path: "agents/helper.md".into(),
            name: "helper".into(),
            description: None,
            kind: AgentKind::Chatbot,
            model: None,
            tools: None,
            permissions: Default::default(),
            max_spawn_depth: None,
            context_files: Vec::new(),
            services: Vec::new(),
            system_prompt: String::new(),
        };
        let scope = SessionScope {
            session_id: Some("s1".into()),
            document_path: Some("daily/today.md".into()),
        };

        assert_eq!(scope.key_for(&agent).discriminator, "s1");

        agent.kind = AgentKind::Document;
        assert_eq!(scope.key_for(&agent).discriminator, "daily/today.md");

        agent.kind = AgentKind::Standalone;
        assert_eq!(scope.key_for(&agent).discriminator, "default");
    }
}
