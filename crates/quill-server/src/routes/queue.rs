//! Queue snapshot, per-item streaming, and drain nudge

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

use quill_core::events::StreamEvent;
use quill_core::queue::{ItemStatus, QueueState};

use crate::error::AppError;
use crate::AppState;

const SSE_CHANNEL_BUFFER: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(queue_state))
        .route("/process", post(process_queue))
        .route("/:id/stream", get(stream_item))
}

async fn queue_state(State(state): State<AppState>) -> Json<QueueState> {
    Json(state.services.queue.get_state().await)
}

/// Nudge the drain loop.
async fn process_queue(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.orchestrator.nudge();
    Json(json!({"processing": true}))
}

/// SSE stream of one queue item's execution events.
///
/// Opens with `connected` carrying the item summary. A subscriber that
/// arrives after the terminal event (within the linger window, or for a
/// retained terminal item) gets the outcome replayed and an immediate
/// close.
async fn stream_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let item = state
        .services
        .queue
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("queue item {} not found", id)))?;

    let mut bus_rx = state.services.events.subscribe(&id).await;
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(SSE_CHANNEL_BUFFER);

    let summary = serde_json::to_value(&item).unwrap_or_default();
    send_event(&tx, &StreamEvent::Connected { item: summary }).await;

    if item.status.is_terminal() {
        let terminal = match item.status {
            ItemStatus::Completed => StreamEvent::Done {
                result: json!({
                    "success": true,
                    "response": item.result.clone().unwrap_or_default(),
                }),
            },
            _ => StreamEvent::Error {
                error: item.error.clone().unwrap_or_else(|| "failed".to_string()),
            },
        };
        send_event(&tx, &terminal).await;
        send_event(&tx, &StreamEvent::Close).await;
    } else {
        tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(event) => {
                        let is_close = matches!(event, StreamEvent::Close);
                        if !send_event(&tx, &event).await || is_close {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(item = %id, skipped, "queue stream subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let stream = ReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn send_event(tx: &mpsc::Sender<Result<Event, Infallible>>, event: &StreamEvent) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("failed to serialize stream event: {}", e);
            return true;
        }
    };
    tx.send(Ok(Event::default().data(json))).await.is_ok()
}
