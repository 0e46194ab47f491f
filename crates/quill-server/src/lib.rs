//! Quill Server
//!
//! REST/SSE surface over the orchestration runtime: chat execution,
//! session management, queue inspection, document-agent management, and
//! permission brokering. This is a library crate — the server is started
//! via [`start_server`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderValue, Method};
use axum::{middleware, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use quill_core::llm::{mock::MockLlm, LlmClient};
use quill_core::vault::Vault;
use quill_core::{build_services, Config, Orchestrator, OrchestratorConfig};

pub mod auth;
pub mod error;
pub mod routes;
pub mod types;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// The composed core services; handlers reach through these directly
    /// for reads and through the orchestrator for executions.
    pub services: quill_core::OrchestratorServices,
    pub orchestrator: Arc<Orchestrator>,
    pub started_at: Instant,
}

/// Boot the runtime and assemble the router.
pub async fn build_router(config: Config) -> anyhow::Result<(Router, AppState)> {
    let vault = Arc::new(Vault::open(&config.vault_path)?);
    tracing::info!(root = %vault.root().display(), "vault opened");

    let llm: Option<Arc<dyn LlmClient>> = if config.use_mock_llm {
        tracing::warn!("running against the scripted mock LLM client");
        Some(Arc::new(MockLlm::new()))
    } else {
        // The real client is wired in by the embedding binary; without
        // one, executions fail fast and every other endpoint still works.
        None
    };
    build_router_with_llm(config, vault, llm).await
}

/// Router assembly with an explicit LLM client, for embedders and tests.
pub async fn build_router_with_llm(
    config: Config,
    vault: Arc<Vault>,
    llm: Option<Arc<dyn LlmClient>>,
) -> anyhow::Result<(Router, AppState)> {
    if llm.is_none() {
        tracing::warn!("no LLM client configured; chat execution will be unavailable");
    }

    let services = build_services(vault, llm, config.max_spawn_depth);

    match services.queue.load().await {
        Ok(restored) if restored > 0 => {
            tracing::info!(restored, "queue snapshot restored");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("failed to restore queue snapshot: {:#}", e),
    }
    if let Err(e) = services.sessions.load_index().await {
        tracing::warn!("failed to build session index: {:#}", e);
    }

    let orchestrator = Arc::new(Orchestrator::new(
        services.clone(),
        OrchestratorConfig {
            max_concurrent: config.max_concurrent,
            max_spawn_depth: config.max_spawn_depth,
            ..Default::default()
        },
    ));

    let state = AppState {
        config: Arc::new(config),
        services,
        orchestrator,
        started_at: Instant::now(),
    };

    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
    ];
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(Any)
    };

    let app = Router::new()
        .nest(
            "/api",
            routes::api_router().layer(middleware::from_fn_with_state(
                state.clone(),
                auth::auth_middleware,
            )),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    Ok((app, state))
}

/// Start the server and block until shutdown.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let (app, state) = build_router(config).await?;

    let loop_handles = state.orchestrator.spawn_loops();

    tracing::info!("quill server listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop accepting work, wait out in-flight executions, persist state.
    state.orchestrator.shutdown(SHUTDOWN_GRACE).await;
    for handle in loop_handles {
        handle.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::warn!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
