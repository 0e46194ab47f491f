//! Session store.
//!
//! One text file per session under `<vault>/agent-sessions/<agent>/`; the
//! file is the source of truth. At boot the store builds a lightweight
//! index over the sessions directory plus two legacy roots, and loads full
//! records lazily on first access. Idle records are evicted from memory
//! without touching their files.
//!
//! Persistence is write-on-change and best-effort: a failed disk write is
//! logged and the in-memory record stays authoritative until the next
//! successful save.

pub mod context;
pub mod format;
pub mod record;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::llm::{self, LlmClient, QueryOptions};
use context::SessionSource;
use record::{normalize_upstream_handle, Message, Role, Session, SessionKey, SessionScope};

const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(30 * 60);
/// Newest root is written to; the legacy roots are index-only.
const SESSIONS_DIR: &str = "agent-sessions";
const LEGACY_DIRS: [&str; 2] = ["agent-chats", "agent-logs"];

/// Lightweight index entry: enough to list sessions without loading them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    pub id: String,
    pub key: SessionKey,
    pub agent_path: String,
    pub agent_name: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub archived: bool,
    pub upstream_session_id: Option<String>,
    pub message_count: usize,
    #[serde(skip)]
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStoreStats {
    pub indexed: usize,
    pub loaded: usize,
}

#[derive(Default)]
struct StoreInner {
    index: HashMap<String, SessionIndexEntry>,
    by_key: HashMap<SessionKey, String>,
    loaded: HashMap<SessionKey, Session>,
}

pub struct SessionStore {
    sessions_dir: PathBuf,
    legacy_dirs: Vec<PathBuf>,
    inner: RwLock<StoreInner>,
    idle_window: Duration,
    title_llm: Option<Arc<dyn LlmClient>>,
}

impl SessionStore {
    pub fn new(vault_root: &Path, title_llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self {
            sessions_dir: vault_root.join(SESSIONS_DIR),
            legacy_dirs: LEGACY_DIRS.iter().map(|d| vault_root.join(d)).collect(),
            inner: RwLock::new(StoreInner::default()),
            idle_window: DEFAULT_IDLE_WINDOW,
            title_llm,
        }
    }

    #[doc(hidden)]
    pub fn with_idle_window(mut self, window: Duration) -> Self {
        self.idle_window = window;
        self
    }

    /// Build the boot index. Full sessions are not loaded.
    pub async fn load_index(&self) -> Result<usize> {
        let mut roots = vec![self.sessions_dir.clone()];
        roots.extend(self.legacy_dirs.clone());

        let mut inner = self.inner.write().await;
        for root in roots {
            if !root.exists() {
                continue;
            }
            let mut stack = vec![root];
            while let Some(dir) = stack.pop() {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!("unreadable session directory {}: {}", dir.display(), e);
                        continue;
                    }
                };
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if entry.file_type().await?.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                        continue;
                    }
                    // Copies left behind by `clear` carry the live file's
                    // session id; only the live file is indexed.
                    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if name.contains("-archived-") {
                        continue;
                    }
                    match index_file(&path).await {
                        Ok(index_entry) => {
                            inner
                                .by_key
                                .insert(index_entry.key.clone(), index_entry.id.clone());
                            inner.index.insert(index_entry.id.clone(), index_entry);
                        }
                        Err(e) => {
                            tracing::warn!("skipping unparseable session file {}: {:#}", path.display(), e)
                        }
                    }
                }
            }
        }

        let count = inner.index.len();
        tracing::info!(sessions = count, "session index built");
        Ok(count)
    }

    /// Fetch or create the session for `(agent, scope)`.
    ///
    /// Returns the record plus where it came from (memory, disk, or new).
    pub async fn get_or_create(
        &self,
        agent: &crate::agents::AgentDefinition,
        scope: &SessionScope,
    ) -> Result<(Session, SessionSource)> {
        let key = scope.key_for(agent);
        let mut inner = self.inner.write().await;

        if let Some(session) = inner.loaded.get_mut(&key) {
            session.last_accessed = Utc::now();
            return Ok((session.clone(), SessionSource::Cache));
        }

        if let Some(id) = inner.by_key.get(&key).cloned() {
            if let Some(entry) = inner.index.get(&id) {
                let path = entry.file_path.clone();
                match load_file(&path).await {
                    Ok(mut session) => {
                        session.last_accessed = Utc::now();
                        inner.loaded.insert(key.clone(), session.clone());
                        return Ok((session, SessionSource::Disk));
                    }
                    Err(e) => {
                        tracing::warn!(key = %key, "failed to load session file, recreating: {:#}", e);
                    }
                }
            }
        }

        let session = self.create_session(agent, scope, &key).await;
        inner.by_key.insert(key.clone(), session.id.clone());
        inner.index.insert(session.id.clone(), index_entry_of(&session));
        inner.loaded.insert(key, session.clone());
        Ok((session, SessionSource::New))
    }

    async fn create_session(
        &self,
        agent: &crate::agents::AgentDefinition,
        scope: &SessionScope,
        key: &SessionKey,
    ) -> Session {
        let now = Utc::now();
        let mut file_name = now.format("%Y-%m-%d").to_string();
        if key.discriminator != SessionKey::DEFAULT_DISCRIMINATOR {
            file_name.push('-');
            file_name.push_str(&sanitize_component(&key.discriminator));
        }
        let dir = self.sessions_dir.join(sanitize_component(&agent.name));
        let mut file_path = dir.join(format!("{file_name}.txt"));
        if file_path.exists() {
            // Same agent, day, and discriminator as an unindexed leftover.
            let id_suffix: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
            file_path = dir.join(format!("{file_name}-{id_suffix}.txt"));
        }

        let mut context = serde_json::Map::new();
        if let Some(sid) = &scope.session_id {
            context.insert("sessionId".to_string(), serde_json::Value::String(sid.clone()));
        }
        if let Some(doc) = &scope.document_path {
            context.insert(
                "documentPath".to_string(),
                serde_json::Value::String(doc.clone()),
            );
        }

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.clone(),
            agent_path: agent.path.clone(),
            agent_name: agent.name.clone(),
            title: None,
            messages: Vec::new(),
            upstream_session_id: None,
            created_at: now,
            last_accessed: now,
            archived: false,
            context: if context.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(context))
            },
            file_path,
        };

        persist(&session).await;
        tracing::info!(session_id = %session.id, key = %session.key, "session created");
        session
    }

    /// Append a message and persist. The in-memory record is updated even
    /// when the disk write fails.
    pub async fn add_message(
        &self,
        key: &SessionKey,
        role: Role,
        content: &str,
    ) -> Result<Message> {
        let mut inner = self.inner.write().await;
        self.ensure_loaded_locked(&mut inner, key).await?;
        let session = inner
            .loaded
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown session key: {}", key))?;

        let message = session.append(role, content).clone();
        let snapshot = session.clone();
        if let Some(entry) = inner.index.get_mut(&snapshot.id) {
            entry.message_count = snapshot.messages.len();
            entry.last_accessed = snapshot.last_accessed;
        }
        persist(&snapshot).await;
        Ok(message)
    }

    /// Store (or clear) the upstream handle for a session. Invalid values
    /// normalize to absent before they can reach disk.
    pub async fn update_upstream_handle(
        &self,
        key: &SessionKey,
        handle: Option<&str>,
    ) -> Result<()> {
        let normalized = normalize_upstream_handle(handle);
        let mut inner = self.inner.write().await;
        self.ensure_loaded_locked(&mut inner, key).await?;
        let session = inner
            .loaded
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown session key: {}", key))?;

        if session.upstream_session_id == normalized {
            return Ok(());
        }
        session.upstream_session_id = normalized.clone();
        let snapshot = session.clone();
        if let Some(entry) = inner.index.get_mut(&snapshot.id) {
            entry.upstream_session_id = normalized;
        }
        persist(&snapshot).await;
        Ok(())
    }

    pub async fn get_messages(&self, key: &SessionKey) -> Result<Vec<Message>> {
        let mut inner = self.inner.write().await;
        if self.ensure_loaded_locked(&mut inner, key).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(inner
            .loaded
            .get(key)
            .map(|s| s.messages.clone())
            .unwrap_or_default())
    }

    /// Archive the current file under a timestamp suffix and reset the
    /// record to an empty conversation.
    pub async fn clear(&self, key: &SessionKey) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if self.ensure_loaded_locked(&mut inner, key).await.is_err() {
            return Ok(false);
        }
        let Some(session) = inner.loaded.get_mut(key) else {
            return Ok(false);
        };

        if session.file_path.exists() {
            let archived_path = archived_file_path(&session.file_path);
            if let Err(e) = tokio::fs::rename(&session.file_path, &archived_path).await {
                tracing::warn!(
                    "failed to archive session file {}: {}",
                    session.file_path.display(),
                    e
                );
            }
        }

        session.messages.clear();
        session.upstream_session_id = None;
        session.title = None;
        session.last_accessed = Utc::now();
        let snapshot = session.clone();
        if let Some(entry) = inner.index.get_mut(&snapshot.id) {
            entry.message_count = 0;
            entry.title = None;
            entry.upstream_session_id = None;
        }
        persist(&snapshot).await;
        tracing::info!(key = %key, "session cleared");
        Ok(true)
    }

    /// Permanently delete a session and its file.
    pub async fn delete(&self, key: &SessionKey) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let id = match inner.by_key.get(key) {
            Some(id) => id.clone(),
            None => return Ok(false),
        };
        self.delete_locked(&mut inner, &id).await
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        self.delete_locked(&mut inner, id).await
    }

    async fn delete_locked(&self, inner: &mut StoreInner, id: &str) -> Result<bool> {
        let Some(entry) = inner.index.remove(id) else {
            return Ok(false);
        };
        inner.by_key.remove(&entry.key);
        inner.loaded.remove(&entry.key);
        if entry.file_path.exists() {
            if let Err(e) = tokio::fs::remove_file(&entry.file_path).await {
                tracing::warn!("failed to delete session file {}: {}", entry.file_path.display(), e);
            }
        }
        tracing::info!(session_id = %id, "session deleted");
        Ok(true)
    }

    pub async fn list(&self) -> Vec<SessionIndexEntry> {
        let inner = self.inner.read().await;
        inner.index.values().cloned().collect()
    }

    /// Full session lookup by stable id; consults the loaded map first.
    pub async fn get_by_id(&self, id: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.loaded.values_mut().find(|s| s.id == id) {
            session.last_accessed = Utc::now();
            return Some(session.clone());
        }
        let entry = inner.index.get(id)?.clone();
        match load_file(&entry.file_path).await {
            Ok(mut session) => {
                session.last_accessed = Utc::now();
                inner.loaded.insert(session.key.clone(), session.clone());
                Some(session)
            }
            Err(e) => {
                tracing::warn!(session_id = %id, "failed to load session: {:#}", e);
                None
            }
        }
    }

    pub async fn set_archived(&self, id: &str, archived: bool) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.index.get(id).cloned() else {
            return Ok(false);
        };

        let session = match inner.loaded.get_mut(&entry.key) {
            Some(session) => {
                session.archived = archived;
                session.clone()
            }
            None => {
                let mut session = load_file(&entry.file_path).await?;
                session.archived = archived;
                inner.loaded.insert(session.key.clone(), session.clone());
                session
            }
        };

        if let Some(entry) = inner.index.get_mut(id) {
            entry.archived = archived;
        }
        persist(&session).await;
        Ok(true)
    }

    /// Update the human title and persist.
    pub async fn set_title(&self, key: &SessionKey, title: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        self.ensure_loaded_locked(&mut inner, key).await?;
        let session = inner
            .loaded
            .get_mut(key)
            .ok_or_else(|| anyhow!("unknown session key: {}", key))?;
        session.title = Some(title.to_string());
        let snapshot = session.clone();
        if let Some(entry) = inner.index.get_mut(&snapshot.id) {
            entry.title = Some(title.to_string());
        }
        persist(&snapshot).await;
        Ok(())
    }

    /// Drop loaded records idle past the configured window. Files are
    /// untouched.
    pub async fn evict_stale(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.idle_window).unwrap_or(chrono::Duration::minutes(30));
        let mut inner = self.inner.write().await;
        let before = inner.loaded.len();
        inner.loaded.retain(|_, s| s.last_accessed >= cutoff);
        let evicted = before - inner.loaded.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle sessions from memory");
        }
        evicted
    }

    /// Archive sessions untouched for more than `max_age_days`. Nothing is
    /// deleted; deletion stays an explicit operation.
    pub async fn cleanup(&self, max_age_days: i64) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days);
        let stale: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .index
                .values()
                .filter(|e| !e.archived && e.last_accessed < cutoff)
                .map(|e| e.id.clone())
                .collect()
        };

        let mut archived = 0usize;
        for id in stale {
            if self.set_archived(&id, true).await.unwrap_or(false) {
                archived += 1;
            }
        }
        if archived > 0 {
            tracing::info!(archived, max_age_days, "archived stale sessions");
        }
        Ok(archived)
    }

    pub async fn stats(&self) -> SessionStoreStats {
        let inner = self.inner.read().await;
        SessionStoreStats {
            indexed: inner.index.len(),
            loaded: inner.loaded.len(),
        }
    }

    /// After the first completed exchange, generate a title off the
    /// response path. Skipped when no client is configured.
    pub fn spawn_title_synthesis(self: &Arc<Self>, key: SessionKey) {
        let Some(llm) = self.title_llm.clone() else {
            return;
        };
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let messages = match store.get_messages(&key).await {
                Ok(m) => m,
                Err(_) => return,
            };
            let Some(first_user) = messages.iter().find(|m| m.role == Role::User) else {
                return;
            };
            let Some(first_assistant) = messages.iter().find(|m| m.role == Role::Assistant) else {
                return;
            };

            let prompt = format!(
                "Write a title of at most eight words for this conversation. Reply with the title only.\n\nUser: {}\n\nAssistant: {}",
                first_user.content, first_assistant.content
            );
            match llm::collect_text(llm.as_ref(), prompt, QueryOptions::default()).await {
                Ok(title) => {
                    let title = title.trim().trim_matches('"').to_string();
                    if title.is_empty() {
                        return;
                    }
                    if let Err(e) = store.set_title(&key, &title).await {
                        tracing::warn!(key = %key, "failed to persist generated title: {:#}", e);
                    }
                }
                Err(e) => tracing::debug!(key = %key, "title synthesis skipped: {}", e),
            }
        });
    }

    async fn ensure_loaded_locked(&self, inner: &mut StoreInner, key: &SessionKey) -> Result<()> {
        if inner.loaded.contains_key(key) {
            return Ok(());
        }
        let id = inner
            .by_key
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("unknown session key: {}", key))?;
        let entry = inner
            .index
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("index entry missing for session {}", id))?;
        let session = load_file(&entry.file_path).await?;
        inner.loaded.insert(key.clone(), session);
        Ok(())
    }
}

async fn index_file(path: &Path) -> Result<SessionIndexEntry> {
    let content = tokio::fs::read_to_string(path).await?;
    let session = format::parse_session(&content, path)?;
    let message_count = format::count_messages(&content);
    Ok(SessionIndexEntry {
        id: session.id,
        key: session.key,
        agent_path: session.agent_path,
        agent_name: session.agent_name,
        title: session.title,
        created_at: session.created_at,
        last_accessed: session.last_accessed,
        archived: session.archived,
        upstream_session_id: session.upstream_session_id,
        message_count,
        file_path: path.to_path_buf(),
    })
}

fn index_entry_of(session: &Session) -> SessionIndexEntry {
    SessionIndexEntry {
        id: session.id.clone(),
        key: session.key.clone(),
        agent_path: session.agent_path.clone(),
        agent_name: session.agent_name.clone(),
        title: session.title.clone(),
        created_at: session.created_at,
        last_accessed: session.last_accessed,
        archived: session.archived,
        upstream_session_id: session.upstream_session_id.clone(),
        message_count: session.messages.len(),
        file_path: session.file_path.clone(),
    }
}

async fn load_file(path: &Path) -> Result<Session> {
    let content = tokio::fs::read_to_string(path).await?;
    format::parse_session(&content, path)
}

/// Best-effort write of the canonical file form.
async fn persist(session: &Session) {
    let content = format::format_session(session);
    if let Some(parent) = session.file_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!("failed to create session directory {}: {}", parent.display(), e);
            return;
        }
    }
    if let Err(e) = tokio::fs::write(&session.file_path, content).await {
        tracing::warn!(
            session_id = %session.id,
            "failed to persist session to {}: {}",
            session.file_path.display(),
            e
        );
    }
}

fn archived_file_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("session");
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    path.with_file_name(format!("{stem}-archived-{stamp}.txt"))
}

fn sanitize_component(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "session".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentDefinition, AgentKind};

    fn agent() -> AgentDefinition {
        AgentDefinition {
            path: "agents/helper.md".into(),
            name: "helper".into(),
            description: None,
            kind: AgentKind::Chatbot,
            model: None,
            tools: None,
            permissions: Default::default(),
            max_spawn_depth: None,
            context_files: Vec::new(),
            services: Vec::new(),
            system_prompt: String::new(),
        }
    }

    fn scope(session_id: &str) -> SessionScope {
        SessionScope {
            session_id: Some(session_id.to_string()),
            document_path: None,
        }
    }

    #[tokio::test]
    async fn create_add_and_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), None);
        let agent = agent();

        let (session, source) = store.get_or_create(&agent, &scope("s1")).await.unwrap();
        assert!(matches!(source, SessionSource::New));

        store
            .add_message(&session.key, Role::User, "Hello")
            .await
            .unwrap();
        store
            .add_message(&session.key, Role::Assistant, "Hi!")
            .await
            .unwrap();
        store
            .update_upstream_handle(&session.key, Some("sess_up"))
            .await
            .unwrap();

        // Fresh store simulates a restart: index only, then lazy load.
        let restarted = SessionStore::new(dir.path(), None);
        let indexed = restarted.load_index().await.unwrap();
        assert_eq!(indexed, 1);
        assert_eq!(restarted.stats().await.loaded, 0);

        let entries = restarted.list().await;
        assert_eq!(entries[0].message_count, 2);
        assert_eq!(entries[0].upstream_session_id.as_deref(), Some("sess_up"));

        let (reloaded, source) = restarted.get_or_create(&agent, &scope("s1")).await.unwrap();
        assert!(matches!(source, SessionSource::Disk));
        assert_eq!(reloaded.id, session.id);
        assert_eq!(reloaded.messages.len(), 2);
        assert_eq!(reloaded.messages[0].content, "Hello");
    }

    #[tokio::test]
    async fn file_round_trips_after_every_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), None);
        let agent = agent();
        let (session, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();

        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            store
                .add_message(&session.key, Role::User, text)
                .await
                .unwrap();
            let content = std::fs::read_to_string(&session.file_path).unwrap();
            let parsed = format::parse_session(&content, &session.file_path).unwrap();
            assert_eq!(parsed.id, session.id);
            assert_eq!(parsed.messages.len(), i + 1);
            assert_eq!(parsed.messages[i].content, *text);
        }
    }

    #[tokio::test]
    async fn corrupt_handle_never_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), None);
        let agent = agent();
        let (session, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();

        store
            .update_upstream_handle(&session.key, Some("[object Object]"))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&session.file_path).unwrap();
        assert!(content.contains("sdk_session_id: \n"));
        let (reloaded, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();
        assert_eq!(reloaded.upstream_session_id, None);
    }

    #[tokio::test]
    async fn distinct_scopes_get_distinct_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), None);
        let agent = agent();

        let (a, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();
        let (b, _) = store.get_or_create(&agent, &scope("s2")).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.file_path, b.file_path);
    }

    #[tokio::test]
    async fn clear_archives_the_file_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), None);
        let agent = agent();
        let (session, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();
        store
            .add_message(&session.key, Role::User, "Hello")
            .await
            .unwrap();
        store
            .update_upstream_handle(&session.key, Some("h1"))
            .await
            .unwrap();

        assert!(store.clear(&session.key).await.unwrap());

        let messages = store.get_messages(&session.key).await.unwrap();
        assert!(messages.is_empty());
        let (reloaded, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();
        assert_eq!(reloaded.upstream_session_id, None);

        // An archived copy of the old conversation stays on disk.
        let parent = session.file_path.parent().unwrap();
        let archived = std::fs::read_dir(parent)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("-archived-"))
            .count();
        assert_eq!(archived, 1);
    }

    #[tokio::test]
    async fn delete_removes_file_and_maps() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), None);
        let agent = agent();
        let (session, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();

        assert!(store.delete_by_id(&session.id).await.unwrap());
        assert!(!session.file_path.exists());
        assert!(store.get_by_id(&session.id).await.is_none());
        assert!(store.list().await.is_empty());

        // Idempotent.
        assert!(!store.delete_by_id(&session.id).await.unwrap());
    }

    #[tokio::test]
    async fn eviction_drops_idle_records_but_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            SessionStore::new(dir.path(), None).with_idle_window(Duration::from_secs(0));
        let agent = agent();
        let (session, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();
        store
            .add_message(&session.key, Role::User, "Hello")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let evicted = store.evict_stale().await;
        assert_eq!(evicted, 1);
        assert_eq!(store.stats().await.loaded, 0);

        // Still reachable; reloads from disk.
        let (reloaded, source) = store.get_or_create(&agent, &scope("s1")).await.unwrap();
        assert!(matches!(source, SessionSource::Disk));
        assert_eq!(reloaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn archive_flag_round_trips_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), None);
        let agent = agent();
        let (session, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();

        assert!(store.set_archived(&session.id, true).await.unwrap());
        assert!(store.get_by_id(&session.id).await.unwrap().archived);
        assert!(store.set_archived(&session.id, false).await.unwrap());
        assert!(!store.get_by_id(&session.id).await.unwrap().archived);
        assert!(!store.set_archived("missing", true).await.unwrap());
    }

    #[tokio::test]
    async fn legacy_roots_are_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), None);
        let agent = agent();
        let (session, _) = store.get_or_create(&agent, &scope("s1")).await.unwrap();
        drop(store);

        // Move the file into a legacy root and re-index.
        let legacy = dir.path().join("agent-chats/helper");
        std::fs::create_dir_all(&legacy).unwrap();
        let legacy_path = legacy.join(session.file_path.file_name().unwrap());
        std::fs::rename(&session.file_path, &legacy_path).unwrap();

        let restarted = SessionStore::new(dir.path(), None);
        assert_eq!(restarted.load_index().await.unwrap(), 1);
        assert!(restarted.get_by_id(&session.id).await.is_some());
    }
}
