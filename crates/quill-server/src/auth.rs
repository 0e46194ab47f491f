//! API-key middleware.
//!
//! Single-tenant local mode runs open; configuring `QUILL_API_KEY` requires
//! the `X-API-Key` header on every `/api/*` request.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::AppState;

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.api_key {
        let provided = request
            .headers()
            .get("X-API-Key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            tracing::debug!("rejected request with missing or wrong API key");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid or missing API key", "code": "UNAUTHORIZED"})),
            )
                .into_response();
        }
    }
    next.run(request).await
}
