//! API routes

use axum::Router;

use crate::AppState;

mod agents;
mod chat;
mod documents;
mod health;
mod permissions;
mod queue;
mod sessions;
mod triggers;
mod vault;

/// Build the API router with all endpoints
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/health", health::router())
        .nest("/agents", agents::router())
        .nest("/chat", chat::router().merge(sessions::router()))
        .nest("/queue", queue::router())
        .nest("/documents", documents::router())
        .nest("/permissions", permissions::router())
        .nest("/triggers", triggers::router())
        .merge(vault::router())
}
