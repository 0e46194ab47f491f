//! Unified error handling for the API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use quill_core::queue::QueueError;
use quill_core::vault::VaultError;

/// API error response body
#[derive(Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
}

/// Application error types
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    PayloadTooLarge(String),
    Capacity(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            AppError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", msg)
            }
            AppError::Capacity(msg) => (StatusCode::SERVICE_UNAVAILABLE, "CAPACITY", msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
        };

        (
            status,
            Json(ApiError {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        // Typed causes map to their status; everything else is a 500.
        for cause in err.chain() {
            if let Some(vault_err) = cause.downcast_ref::<VaultError>() {
                return match vault_err {
                    VaultError::NotFound(path) => {
                        AppError::NotFound(format!("not found: {}", path))
                    }
                    VaultError::Escape(path) => {
                        AppError::BadRequest(format!("invalid path: {}", path))
                    }
                };
            }
            if let Some(queue_err) = cause.downcast_ref::<QueueError>() {
                return match queue_err {
                    QueueError::Full(_) => AppError::Capacity(queue_err.to_string()),
                    QueueError::DepthExceeded { .. } => {
                        AppError::BadRequest(queue_err.to_string())
                    }
                    QueueError::Unknown(id) => {
                        AppError::NotFound(format!("unknown queue item: {}", id))
                    }
                    QueueError::InvalidTransition { .. } => {
                        AppError::Conflict(queue_err.to_string())
                    }
                };
            }
        }
        tracing::error!("Internal error: {:?}", err);
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON error: {}", err))
    }
}
