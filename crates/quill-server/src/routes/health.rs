//! Liveness and metrics endpoint

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

use crate::types::{HealthMetrics, HealthQuery, HealthResponse, QueueMetrics};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health))
}

async fn health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
) -> Json<HealthResponse> {
    let metrics = if query.detailed {
        let queue_state = state.services.queue.get_state().await;
        Some(HealthMetrics {
            uptime_seconds: state.started_at.elapsed().as_secs(),
            queue: QueueMetrics {
                pending: queue_state.pending.len(),
                running: queue_state.running.len(),
                completed: queue_state.completed.len(),
            },
            sessions: state.services.sessions.stats().await,
            pending_permissions: state.services.broker.list_pending().await.len(),
            vault_root: state.services.vault.root().to_string_lossy().to_string(),
        })
    } else {
        None
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        metrics,
    })
}
