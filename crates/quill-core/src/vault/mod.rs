//! Filesystem vault access.
//!
//! All documents live under a single configured root. Every path that
//! reaches the vault is vault-relative; [`Vault::resolve`] rejects anything
//! that would escape the root before any I/O happens.

pub mod frontmatter;

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

/// Path rejected by [`Vault::resolve`].
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("path escapes the vault root: `{0}`")]
    Escape(String),

    #[error("document not found: `{0}`")]
    NotFound(String),
}

/// A single search hit from [`Vault::search`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub line: usize,
    pub snippet: String,
}

/// Aggregate stats for the vault summary endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct VaultSummary {
    pub root: String,
    pub documents: usize,
    pub agent_documents: usize,
}

/// Handle to the vault root directory.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    /// Open a vault, creating the root directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create vault root {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to canonicalize vault root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a vault-relative path to an absolute one.
    ///
    /// Rejects absolute paths and any `..` component. The target does not
    /// need to exist.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, VaultError> {
        let candidate = Path::new(relative);
        if candidate.is_absolute() {
            return Err(VaultError::Escape(relative.to_string()));
        }
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(VaultError::Escape(relative.to_string())),
            }
        }
        Ok(self.root.join(candidate))
    }

    /// Convert an absolute path back to vault-relative form, if it is
    /// inside the root.
    pub fn to_relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    pub async fn exists(&self, relative: &str) -> bool {
        match self.resolve(relative) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn read(&self, relative: &str) -> Result<String> {
        let path = self.resolve(relative)?;
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(VaultError::NotFound(relative.to_string()).into());
        }
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }

    /// Write a document, creating parent directories as needed.
    pub async fn write(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// List every text document in the vault, vault-relative, sorted.
    ///
    /// Hidden entries (dotfiles, `.queue`, legacy dot-directories) are
    /// skipped.
    pub async fn list_documents(&self) -> Result<Vec<String>> {
        let mut found = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("skipping unreadable directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if is_document(&name) {
                    if let Some(rel) = self.to_relative(&path) {
                        found.push(rel);
                    }
                }
            }
        }

        found.sort();
        Ok(found)
    }

    /// Case-insensitive substring search over document bodies.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let needle = query.to_lowercase();
        let mut hits = Vec::new();

        for path in self.list_documents().await? {
            let content = match self.read(&path).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            for (idx, line) in content.lines().enumerate() {
                if line.to_lowercase().contains(&needle) {
                    hits.push(SearchHit {
                        path: path.clone(),
                        line: idx + 1,
                        snippet: truncate_snippet(line),
                    });
                    if hits.len() >= limit {
                        return Ok(hits);
                    }
                    break;
                }
            }
        }

        Ok(hits)
    }

    pub async fn summary(&self) -> Result<VaultSummary> {
        let documents = self.list_documents().await?;
        let agent_documents = documents
            .iter()
            .filter(|p| p.starts_with("agents/"))
            .count();
        Ok(VaultSummary {
            root: self.root.to_string_lossy().to_string(),
            documents: documents.len(),
            agent_documents,
        })
    }
}

fn is_document(name: &str) -> bool {
    name.ends_with(".md") || name.ends_with(".txt")
}

fn truncate_snippet(line: &str) -> String {
    const MAX: usize = 200;
    if line.chars().count() <= MAX {
        line.trim().to_string()
    } else {
        let cut: String = line.chars().take(MAX).collect();
        format!("{}…", cut.trim())
    }
}
