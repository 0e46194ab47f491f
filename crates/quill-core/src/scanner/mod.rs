//! Document scanner.
//!
//! Documents opt into automation by carrying an `agents:` list in their
//! front matter. The scanner enumerates those entries, evaluates their
//! triggers, and rewrites only the agent list when a status changes — the
//! document body is never touched.

pub mod triggers;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::vault::{frontmatter, Vault};
use triggers::TriggerSpec;

const AGENTS_KEY: &str = "agents";

/// Lifecycle of a per-document agent entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    NeedsRun,
    Running,
    Completed,
    Error,
}

/// One agent entry inside a document's front matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentAgent {
    /// Vault-relative path of the agent definition.
    pub agent: String,
    #[serde(default)]
    pub status: AgentStatus,
    /// Textual trigger spec, e.g. `daily@06:00`. Kept verbatim.
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_trigger() -> String {
    "manual".to_string()
}

fn default_enabled() -> bool {
    true
}

impl DocumentAgent {
    pub fn trigger_spec(&self) -> Option<TriggerSpec> {
        TriggerSpec::parse(&self.trigger)
    }

    fn last_run_local(&self) -> Option<DateTime<Local>> {
        self.last_run
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Local))
    }
}

/// Optional fields written alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct StatusExtras {
    pub last_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub last_error: Option<String>,
}

impl StatusExtras {
    pub fn completed(result: impl Into<String>) -> Self {
        Self {
            last_run: Some(Utc::now()),
            last_result: Some(result.into()),
            last_error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            last_run: Some(Utc::now()),
            last_result: None,
            last_error: Some(error.into()),
        }
    }
}

/// Scans vault documents for agent entries and maintains their status.
pub struct DocumentScanner {
    vault: Arc<Vault>,
}

impl DocumentScanner {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    /// All documents carrying a non-empty agent list, with their entries.
    pub async fn scan(&self) -> Result<Vec<(String, Vec<DocumentAgent>)>> {
        let mut out = Vec::new();
        for path in self.vault.list_documents().await? {
            // Agent definition documents are not scan targets.
            if path.starts_with("agents/") {
                continue;
            }
            match self.read_agents(&path).await {
                Ok(agents) if !agents.is_empty() => out.push((path, agents)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(path = %path, "skipping document with bad agent list: {:#}", e)
                }
            }
        }
        Ok(out)
    }

    /// Agent entries for one document. Missing front matter yields an
    /// empty list.
    pub async fn get_document_agents(&self, doc: &str) -> Result<Vec<DocumentAgent>> {
        self.read_agents(doc).await
    }

    /// Replace a document's agent list, preserving the body bytes and the
    /// other front matter keys. Duplicate agent paths keep the first entry.
    pub async fn update_document_agents(&self, doc: &str, agents: &[DocumentAgent]) -> Result<()> {
        let content = self.vault.read(doc).await?;
        let mut parsed = frontmatter::parse(&content)?;

        let mut deduped: Vec<&DocumentAgent> = Vec::new();
        for entry in agents {
            if deduped.iter().any(|e| e.agent == entry.agent) {
                tracing::warn!(doc = %doc, agent = %entry.agent, "dropping duplicate agent entry");
                continue;
            }
            deduped.push(entry);
        }

        let value = serde_yaml::to_value(&deduped)?;
        parsed
            .front_matter
            .insert(serde_yaml::Value::String(AGENTS_KEY.to_string()), value);

        let rebuilt = frontmatter::compose(&parsed.front_matter, &parsed.body)?;
        self.vault.write(doc, &rebuilt).await
    }

    /// All (document, entry) pairs whose triggers fire now.
    pub async fn find_triggered(&self) -> Result<Vec<(String, DocumentAgent)>> {
        let now = Local::now();
        let mut due = Vec::new();
        for (doc, agents) in self.scan().await? {
            for entry in agents {
                if !entry.enabled || entry.status != AgentStatus::Pending {
                    continue;
                }
                let Some(spec) = entry.trigger_spec() else {
                    tracing::warn!(doc = %doc, agent = %entry.agent, trigger = %entry.trigger, "unparseable trigger");
                    continue;
                };
                if spec.is_due(entry.last_run_local(), now) {
                    due.push((doc.clone(), entry));
                }
            }
        }
        Ok(due)
    }

    /// All (document, entry) pairs currently in `needs_run`.
    pub async fn find_needs_run(&self) -> Result<Vec<(String, DocumentAgent)>> {
        let mut out = Vec::new();
        for (doc, agents) in self.scan().await? {
            for entry in agents {
                if entry.enabled && entry.status == AgentStatus::NeedsRun {
                    out.push((doc.clone(), entry));
                }
            }
        }
        Ok(out)
    }

    /// Durably set one entry's status (and optional result fields).
    pub async fn update_status(
        &self,
        doc: &str,
        agent: &str,
        status: AgentStatus,
        extras: StatusExtras,
    ) -> Result<()> {
        let mut agents = self.read_agents(doc).await?;
        let entry = agents
            .iter_mut()
            .find(|e| e.agent == agent)
            .ok_or_else(|| anyhow!("document `{}` has no agent entry for `{}`", doc, agent))?;

        entry.status = status;
        if let Some(at) = extras.last_run {
            entry.last_run = Some(at.to_rfc3339());
        }
        if extras.last_result.is_some() {
            entry.last_result = extras.last_result;
            entry.last_error = None;
        }
        if extras.last_error.is_some() {
            entry.last_error = extras.last_error;
            entry.last_result = None;
        }

        self.update_document_agents(doc, &agents).await
    }

    /// Entries in a document that have not reached a terminal state.
    pub async fn get_pending(&self, doc: &str) -> Result<Vec<DocumentAgent>> {
        Ok(self
            .read_agents(doc)
            .await?
            .into_iter()
            .filter(|e| {
                matches!(
                    e.status,
                    AgentStatus::Pending | AgentStatus::NeedsRun | AgentStatus::Running
                )
            })
            .collect())
    }

    /// Reset entries back to `pending`. With `agents: None`, resets all.
    pub async fn reset(&self, doc: &str, agents: Option<&[String]>) -> Result<usize> {
        let mut entries = self.read_agents(doc).await?;
        let mut changed = 0usize;
        for entry in entries.iter_mut() {
            let selected = agents.map_or(true, |names| names.iter().any(|n| *n == entry.agent));
            if selected && entry.status != AgentStatus::Pending {
                entry.status = AgentStatus::Pending;
                changed += 1;
            }
        }
        if changed > 0 {
            self.update_document_agents(doc, &entries).await?;
        }
        Ok(changed)
    }

    /// Promote the named entries to `needs_run`.
    pub async fn trigger(&self, doc: &str, agents: &[String]) -> Result<usize> {
        self.promote(doc, |entry| agents.iter().any(|n| *n == entry.agent))
            .await
    }

    /// Promote every enabled entry in the document to `needs_run`.
    pub async fn trigger_all(&self, doc: &str) -> Result<usize> {
        self.promote(doc, |_| true).await
    }

    /// Promote entries whose trigger is `on_save`. Called by the editor
    /// client when the document is written.
    pub async fn trigger_on_save(&self, doc: &str) -> Result<usize> {
        self.promote(doc, |entry| {
            matches!(entry.trigger_spec(), Some(TriggerSpec::OnSave))
        })
        .await
    }

    async fn promote(
        &self,
        doc: &str,
        select: impl Fn(&DocumentAgent) -> bool,
    ) -> Result<usize> {
        let mut entries = self
            .read_agents(doc)
            .await
            .with_context(|| format!("failed to read agent list of `{}`", doc))?;
        let mut changed = 0usize;
        for entry in entries.iter_mut() {
            if entry.enabled
                && select(entry)
                && matches!(entry.status, AgentStatus::Pending | AgentStatus::Completed | AgentStatus::Error)
            {
                entry.status = AgentStatus::NeedsRun;
                changed += 1;
            }
        }
        if changed > 0 {
            self.update_document_agents(doc, &entries).await?;
        }
        Ok(changed)
    }

    async fn read_agents(&self, doc: &str) -> Result<Vec<DocumentAgent>> {
        let content = self.vault.read(doc).await?;
        let parsed = frontmatter::parse(&content)?;
        let Some(value) = parsed.get(AGENTS_KEY) else {
            return Ok(Vec::new());
        };
        let agents: Vec<DocumentAgent> = serde_yaml::from_value(value.clone())
            .with_context(|| format!("invalid `agents` list in `{}`", doc))?;
        Ok(agents)
    }
}
