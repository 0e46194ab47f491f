//! Quill core — the orchestration runtime.
//!
//! Runs LLM-driven agents, declared in vault documents, against a
//! filesystem knowledge base: an execution queue with priority scheduling,
//! file-backed conversation sessions with lazy loading, an interactive
//! permission broker gating write tools, a trigger loop promoting
//! documents to runnable work, and typed event streams for live clients.
//!
//! The HTTP surface lives in `quill-server`; this crate has no transport
//! dependency.

pub mod agents;
pub mod config;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod permissions;
pub mod queue;
pub mod scanner;
pub mod sessions;
pub mod vault;

pub use config::Config;
pub use orchestrator::{build_services, Orchestrator, OrchestratorConfig, OrchestratorServices};
