//! Chat endpoints: unary execution and SSE streaming.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use futures::stream::Stream;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use quill_core::orchestrator::ExecuteRequest;
use quill_core::sessions::record::SessionScope;

use crate::error::AppError;
use crate::types::{ChatDebug, ChatRequest, ChatResponse};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(chat))
        .route("/stream", post(chat_stream))
}

fn build_request(state: &AppState, req: &ChatRequest) -> Result<ExecuteRequest, AppError> {
    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest("message is required".to_string()));
    }
    if req.message.len() > state.config.max_message_bytes {
        return Err(AppError::PayloadTooLarge(format!(
            "message exceeds {} bytes",
            state.config.max_message_bytes
        )));
    }

    let agent_path = req
        .agent_path
        .clone()
        .unwrap_or_else(|| state.config.default_agent.clone());

    Ok(ExecuteRequest {
        agent_path,
        message: req.message.clone(),
        scope: SessionScope {
            session_id: req.session_id.clone(),
            document_path: req.document_path.clone(),
        },
        initial_context: req.initial_context.clone(),
        depth: 0,
    })
}

/// Unary execution: returns the full result record.
async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let exec = build_request(&state, &req)?;
    let agent = state.services.agents.load(&exec.agent_path).await?;

    let outcome = state.orchestrator.execute(exec).await?;
    Ok(Json(ChatResponse {
        outcome,
        debug: ChatDebug {
            agent_path: agent.path,
            model: agent.model,
        },
    }))
}

/// Streaming execution: the same run as an SSE event sequence.
async fn chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let exec = build_request(&state, &req)?;
    let rx = state.orchestrator.execute_streaming(exec).await?;

    let stream = ReceiverStream::new(rx).map(|event| {
        let json = serde_json::to_string(&event)
            .unwrap_or_else(|e| format!("{{\"type\":\"error\",\"error\":\"serialize: {}\"}}", e));
        Ok::<_, Infallible>(Event::default().data(json))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
