//! Manual trigger pass

use axum::{extract::State, routing::post, Json, Router};

use quill_core::orchestrator::TriggerPassReport;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/check", post(check_triggers))
}

/// Force one trigger-loop iteration.
async fn check_triggers(State(state): State<AppState>) -> Json<TriggerPassReport> {
    Json(state.orchestrator.run_trigger_pass().await)
}
