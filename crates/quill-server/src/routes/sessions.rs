//! Session management endpoints

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;

use quill_core::sessions::record::SessionKey;

use crate::error::AppError;
use crate::types::{ClearSessionRequest, ListSessionsQuery, SessionListResponse, SessionResponse};
use crate::AppState;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

/// Mounted under `/chat` alongside the execution endpoints.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/session/:id", get(get_session).delete(delete_session))
        .route("/session/:id/archive", post(archive_session))
        .route("/session/:id/unarchive", post(unarchive_session))
        .route("/session", delete(clear_session))
}

/// Paginated session index. Served from the boot index; no full session
/// loads.
async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Json<SessionListResponse> {
    let archived = query.archived.unwrap_or(false);
    let mut sessions: Vec<_> = state
        .services
        .sessions
        .list()
        .await
        .into_iter()
        .filter(|s| s.archived == archived)
        .collect();

    match query.sort.as_deref() {
        Some("oldest") => sessions.sort_by_key(|s| s.last_accessed),
        _ => sessions.sort_by_key(|s| std::cmp::Reverse(s.last_accessed)),
    }

    let total = sessions.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(MAX_PAGE_SIZE);
    let sessions = sessions.into_iter().skip(offset).take(limit).collect();

    Json(SessionListResponse {
        sessions,
        total,
        limit,
        offset,
    })
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = state
        .services
        .sessions
        .get_by_id(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("session {} not found", id)))?;
    Ok(Json(session.into()))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.services.sessions.delete_by_id(&id).await? {
        return Err(AppError::NotFound(format!("session {} not found", id)));
    }
    Ok(Json(json!({"deleted": true})))
}

async fn archive_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    set_archived(&state, &id, true).await
}

async fn unarchive_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    set_archived(&state, &id, false).await
}

async fn set_archived(
    state: &AppState,
    id: &str,
    archived: bool,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.services.sessions.set_archived(id, archived).await? {
        return Err(AppError::NotFound(format!("session {} not found", id)));
    }
    Ok(Json(json!({"archived": archived})))
}

/// Legacy clear: resets the conversation for an (agent, context) pair,
/// archiving the old file.
async fn clear_session(
    State(state): State<AppState>,
    Json(req): Json<ClearSessionRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let discriminator = req
        .document_path
        .or(req.session_id)
        .unwrap_or_else(|| SessionKey::DEFAULT_DISCRIMINATOR.to_string());
    let key = SessionKey::new(req.agent_path, discriminator);

    let cleared = state.services.sessions.clear(&key).await?;
    if !cleared {
        return Err(AppError::NotFound(format!("no session for key {}", key)));
    }
    Ok(Json(json!({"cleared": true})))
}
