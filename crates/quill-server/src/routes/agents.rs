//! Agent listing and spawn endpoints

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};

use quill_core::queue::ExecutionContext;

use crate::error::AppError;
use crate::types::{AgentResponse, SpawnRequest, SpawnResponse};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_agents))
        .route("/spawn", post(spawn_agent))
}

/// List every agent definition in the vault.
async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentResponse>>, AppError> {
    let agents = state.services.agents.list().await?;
    Ok(Json(agents.into_iter().map(Into::into).collect()))
}

/// Enqueue one agent for background execution.
async fn spawn_agent(
    State(state): State<AppState>,
    Json(req): Json<SpawnRequest>,
) -> Result<Json<SpawnResponse>, AppError> {
    let scheduled_for: Option<DateTime<Utc>> = match req.scheduled_for.as_deref() {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| AppError::BadRequest(format!("invalid scheduledFor: {}", e)))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let context = req.context.unwrap_or_default();
    let queue_id = state
        .orchestrator
        .enqueue(
            &req.agent_path,
            ExecutionContext {
                message: req.message,
                document_path: context.document_path,
                parent_agent: None,
                session_id: context.session_id,
            },
            req.priority.unwrap_or_default(),
            0,
            None,
            scheduled_for,
        )
        .await?;

    Ok(Json(SpawnResponse {
        queue_id,
        agent_path: req.agent_path,
    }))
}
