//! Pending permission requests: list, resolve, stream

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use quill_core::permissions::{PermissionEvent, PermissionRequest};

use crate::error::AppError;
use crate::AppState;

const SSE_CHANNEL_BUFFER: usize = 64;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pending))
        .route("/:id/grant", post(grant))
        .route("/:id/deny", post(deny))
        .route("/stream", get(stream))
}

async fn list_pending(State(state): State<AppState>) -> Json<Vec<PermissionRequest>> {
    Json(state.services.broker.list_pending().await)
}

async fn grant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let granted = state.services.broker.grant(&id).await;
    if !granted {
        return Err(AppError::NotFound(format!(
            "no pending permission request {}",
            id
        )));
    }
    Ok(Json(json!({"granted": true})))
}

async fn deny(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let denied = state.services.broker.deny(&id).await;
    if !denied {
        return Err(AppError::NotFound(format!(
            "no pending permission request {}",
            id
        )));
    }
    Ok(Json(json!({"denied": true})))
}

/// SSE stream of permission events. A new subscription first receives
/// `connected` and a replay of the currently pending requests.
async fn stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before the replay so no event falls between them.
    let mut broker_rx = state.services.broker.subscribe();
    let pending = state.services.broker.list_pending().await;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(SSE_CHANNEL_BUFFER);

    let _ = tx
        .send(Ok(Event::default().data(
            json!({"type": "connected", "pending": pending.len()}).to_string(),
        )))
        .await;
    for request in pending {
        send_event(&tx, &PermissionEvent::Request { request }).await;
    }

    tokio::spawn(async move {
        loop {
            match broker_rx.recv().await {
                Ok(event) => {
                    if !send_event(&tx, &event).await {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "permission stream subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn send_event(tx: &mpsc::Sender<Result<Event, Infallible>>, event: &PermissionEvent) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("failed to serialize permission event: {}", e);
            return true;
        }
    };
    tx.send(Ok(Event::default().data(json))).await.is_ok()
}
