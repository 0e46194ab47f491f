//! Request and response types for the API

use serde::{Deserialize, Serialize};

use quill_core::orchestrator::ExecuteOutcome;
use quill_core::queue::Priority;
use quill_core::sessions::record::{Message, Session};
use quill_core::sessions::SessionIndexEntry;

// ============================================================================
// Chat Types
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// User message content
    pub message: String,
    /// Agent to run; falls back to the configured default
    pub agent_path: Option<String>,
    /// Target document for document-bound agents
    pub document_path: Option<String>,
    /// Client-supplied session discriminator for conversational agents
    pub session_id: Option<String>,
    /// Extra system context for this call only
    pub initial_context: Option<String>,
}

/// Unary chat response: the execution outcome plus a debug block.
#[derive(Serialize)]
pub struct ChatResponse {
    #[serde(flatten)]
    pub outcome: ExecuteOutcome,
    pub debug: ChatDebug,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDebug {
    pub agent_path: String,
    pub model: Option<String>,
}

// ============================================================================
// Agent / Spawn Types
// ============================================================================

/// Agent definition summary; the system prompt stays server-side.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub path: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: quill_core::agents::AgentKind,
    pub model: Option<String>,
    pub tools: Option<Vec<String>>,
    pub permissions: quill_core::agents::AgentPermissions,
}

impl From<quill_core::agents::AgentDefinition> for AgentResponse {
    fn from(agent: quill_core::agents::AgentDefinition) -> Self {
        Self {
            path: agent.path,
            name: agent.name,
            description: agent.description,
            kind: agent.kind,
            model: agent.model,
            tools: agent.tools,
            permissions: agent.permissions,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub agent_path: String,
    pub message: Option<String>,
    #[serde(default)]
    pub context: Option<SpawnContext>,
    pub priority: Option<Priority>,
    /// RFC-3339 timestamp to delay execution until
    pub scheduled_for: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SpawnContext {
    pub document_path: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnResponse {
    pub queue_id: String,
    pub agent_path: String,
}

// ============================================================================
// Session Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// `newest` (default) or `oldest`, by last access
    pub sort: Option<String>,
    /// `true` lists archived sessions instead of live ones
    pub archived: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub sessions: Vec<SessionIndexEntry>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: String,
    pub agent_path: String,
    pub agent_name: String,
    pub title: Option<String>,
    pub created_at: String,
    pub last_accessed: String,
    pub archived: bool,
    pub message_count: usize,
    pub messages: Vec<MessageResponse>,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub role: String,
    pub content: String,
    pub timestamp: String,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            agent_path: session.agent_path,
            agent_name: session.agent_name,
            title: session.title,
            created_at: session.created_at.to_rfc3339(),
            last_accessed: session.last_accessed.to_rfc3339(),
            archived: session.archived,
            message_count: session.messages.len(),
            messages: session.messages.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<Message> for MessageResponse {
    fn from(message: Message) -> Self {
        Self {
            role: message.role.header_name().to_lowercase(),
            content: message.content,
            timestamp: message.timestamp.to_rfc3339(),
        }
    }
}

/// Legacy clear-by-key request.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearSessionRequest {
    pub agent_path: String,
    pub document_path: Option<String>,
    pub session_id: Option<String>,
}

// ============================================================================
// Document Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    pub path: String,
    pub front_matter: serde_json::Value,
    pub body: String,
}

#[derive(Deserialize, Default)]
pub struct RunAgentsRequest {
    /// Subset of agent paths to run; all when absent
    #[serde(default)]
    pub agents: Option<Vec<String>>,
}

// ============================================================================
// Health Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HealthMetrics>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub uptime_seconds: u64,
    pub queue: QueueMetrics,
    pub sessions: quill_core::sessions::SessionStoreStats,
    pub pending_permissions: usize,
    pub vault_root: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
}
