//! Document-bound agent management.
//!
//! Document paths contain slashes, so everything below `/api/documents`
//! routes through a wildcard and dispatches on well-known trailing
//! segments (`/agents`, `/agents/pending`, `/run-agents`, `/reset-agents`)
//! and the `trigger/` prefix. Vault documents never shadow those names in
//! practice; a document literally named `run-agents` would need the GET
//! surface.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;

use quill_core::orchestrator::TriggerPassReport;
use quill_core::scanner::DocumentAgent;
use quill_core::vault::frontmatter;

use crate::error::AppError;
use crate::types::{DocumentResponse, RunAgentsRequest};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_documents)).route(
        "/*path",
        get(get_dispatch).post(post_dispatch).put(put_dispatch),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentAgentsEntry {
    path: String,
    agents: Vec<DocumentAgent>,
}

/// List every document carrying agent entries.
async fn list_documents(
    State(state): State<AppState>,
) -> Result<Json<Vec<DocumentAgentsEntry>>, AppError> {
    let scanned = state.services.scanner.scan().await?;
    Ok(Json(
        scanned
            .into_iter()
            .map(|(path, agents)| DocumentAgentsEntry { path, agents })
            .collect(),
    ))
}

async fn get_dispatch(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(doc) = path.strip_suffix("/agents/pending") {
        let pending = state.services.scanner.get_pending(doc).await?;
        return Ok(Json(serde_json::to_value(pending)?));
    }
    if let Some(doc) = path.strip_suffix("/agents") {
        let agents = state.services.scanner.get_document_agents(doc).await?;
        return Ok(Json(serde_json::to_value(agents)?));
    }

    let content = state.services.vault.read(&path).await?;
    let parsed = frontmatter::parse(&content)?;
    let front_matter = serde_json::to_value(&parsed.front_matter)
        .unwrap_or(serde_json::Value::Null);
    Ok(Json(serde_json::to_value(DocumentResponse {
        path,
        front_matter,
        body: parsed.body,
    })?))
}

async fn post_dispatch(
    State(state): State<AppState>,
    Path(path): Path<String>,
    body: Option<Json<RunAgentsRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    // Editor on-save hook: advance `on_save` entries and run them.
    if let Some(doc) = path.strip_prefix("trigger/") {
        let report = state.orchestrator.trigger_on_save(doc).await?;
        return Ok(Json(serde_json::to_value(report)?));
    }

    let agents = body.and_then(|Json(req)| req.agents);

    if let Some(doc) = path.strip_suffix("/run-agents") {
        let report: TriggerPassReport = state
            .orchestrator
            .run_document(doc, agents.as_deref())
            .await?;
        return Ok(Json(serde_json::to_value(report)?));
    }
    if let Some(doc) = path.strip_suffix("/reset-agents") {
        let reset = state.services.scanner.reset(doc, agents.as_deref()).await?;
        return Ok(Json(json!({"reset": reset})));
    }

    Err(AppError::NotFound(format!("no document action at {}", path)))
}

/// Replace a document's agent list.
async fn put_dispatch(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Json(agents): Json<Vec<DocumentAgent>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Some(doc) = path.strip_suffix("/agents") else {
        return Err(AppError::NotFound(format!("no document action at {}", path)));
    };
    state
        .services
        .scanner
        .update_document_agents(doc, &agents)
        .await?;
    Ok(Json(json!({"updated": agents.len()})))
}
