//! Vault summary and search

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use quill_core::vault::{SearchHit, VaultSummary};

use crate::error::AppError;
use crate::AppState;

const SEARCH_LIMIT: usize = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/vault", get(vault_summary))
        .route("/search", get(search))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

async fn vault_summary(State(state): State<AppState>) -> Result<Json<VaultSummary>, AppError> {
    Ok(Json(state.services.vault.summary().await?))
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<SearchHit>>, AppError> {
    if query.q.trim().is_empty() {
        return Err(AppError::BadRequest("query must not be empty".to_string()));
    }
    Ok(Json(
        state.services.vault.search(&query.q, SEARCH_LIMIT).await?,
    ))
}
