//! Agent definitions.
//!
//! An agent is declared by a vault document: YAML front matter carries the
//! configuration, the body is the system prompt. Definitions are loaded per
//! request and never cached; a document edit takes effect on the next run.

pub mod globs;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::vault::{frontmatter, Vault};
use globs::PathMatcher;

/// Which execution path an agent takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Conversational agent with a client-supplied session id.
    #[default]
    Chatbot,
    /// Runs against a target document; the document body is prepended as
    /// context and keys the session.
    #[serde(alias = "document-bound")]
    Document,
    /// One-shot execution without session bookkeeping.
    Standalone,
}

/// Path-glob and tool permissions for an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentPermissions {
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub spawn: Vec<String>,
    pub tools: Vec<String>,
}

impl AgentPermissions {
    pub fn write_matcher(&self) -> PathMatcher {
        PathMatcher::new(&self.write)
    }

    pub fn spawn_matcher(&self) -> PathMatcher {
        PathMatcher::new(&self.spawn)
    }
}

/// Front matter schema for an agent document.
#[derive(Debug, Deserialize)]
struct AgentFrontMatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "type", default)]
    kind: AgentKind,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    tools: Option<Vec<String>>,
    #[serde(default)]
    permissions: AgentPermissions,
    #[serde(default)]
    max_spawn_depth: Option<u32>,
    #[serde(default)]
    context_files: Vec<String>,
    #[serde(default)]
    services: Vec<String>,
}

/// A fully resolved agent definition.
///
/// Immutable for the duration of one execution; queue items carry a
/// serialized snapshot so a document edit cannot change work in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Vault-relative path of the defining document. Unique identity.
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: AgentKind,
    #[serde(default)]
    pub model: Option<String>,
    /// Explicit tool whitelist; `None` leaves the choice to the LLM client.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    #[serde(default)]
    pub permissions: AgentPermissions,
    #[serde(default)]
    pub max_spawn_depth: Option<u32>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    pub system_prompt: String,
}

/// Loads agent definitions from the vault.
pub struct AgentLoader {
    vault: Arc<Vault>,
}

impl AgentLoader {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    /// Load the definition at a vault-relative path.
    pub async fn load(&self, agent_path: &str) -> Result<AgentDefinition> {
        let content = self
            .vault
            .read(agent_path)
            .await
            .with_context(|| format!("failed to load agent `{}`", agent_path))?;
        parse_definition(agent_path, &content)
    }

    /// List every definition under `agents/`. Unparseable documents are
    /// logged and skipped.
    pub async fn list(&self) -> Result<Vec<AgentDefinition>> {
        let mut agents = Vec::new();
        for path in self.vault.list_documents().await? {
            if !path.starts_with("agents/") {
                continue;
            }
            match self.load(&path).await {
                Ok(agent) => agents.push(agent),
                Err(e) => tracing::warn!(path = %path, "skipping unparseable agent: {:#}", e),
            }
        }
        Ok(agents)
    }
}

fn parse_definition(agent_path: &str, content: &str) -> Result<AgentDefinition> {
    let parsed = frontmatter::parse(content)?;
    if parsed.front_matter.is_empty() {
        return Err(anyhow!("agent document `{}` has no front matter", agent_path));
    }

    let front: AgentFrontMatter =
        serde_yaml::from_value(serde_yaml::Value::Mapping(parsed.front_matter.clone()))
            .with_context(|| format!("invalid agent front matter in `{}`", agent_path))?;

    let name = front.name.unwrap_or_else(|| default_name(agent_path));
    let system_prompt = parsed.body.trim().to_string();

    Ok(AgentDefinition {
        path: agent_path.to_string(),
        name,
        description: front.description,
        kind: front.kind,
        model: front.model,
        tools: front.tools,
        permissions: front.permissions,
        max_spawn_depth: front.max_spawn_depth,
        context_files: front.context_files,
        services: front.services,
        system_prompt,
    })
}

/// Fall back to the document's file stem when `name:` is absent.
fn default_name(agent_path: &str) -> String {
    agent_path
        .rsplit('/')
        .next()
        .unwrap_or(agent_path)
        .trim_end_matches(".md")
        .trim_end_matches(".txt")
        .to_string()
}
