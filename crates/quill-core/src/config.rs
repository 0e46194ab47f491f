//! Environment-driven configuration.

use std::path::PathBuf;

/// Server and runtime configuration, read from the environment once at
/// boot.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host (`HOST`, default all interfaces).
    pub host: String,
    /// Bind port (`PORT`, default 3333).
    pub port: u16,
    /// Vault root (`VAULT_PATH`, default the bundled sample).
    pub vault_path: PathBuf,
    /// When set, `X-API-Key` is required on every `/api/*` request
    /// (`QUILL_API_KEY`).
    pub api_key: Option<String>,
    /// Allowed CORS origins (`CORS_ORIGINS`, comma-separated; empty
    /// allows any).
    pub cors_origins: Vec<String>,
    /// Max inbound chat message size in bytes (`MAX_MESSAGE_SIZE`).
    pub max_message_bytes: usize,
    /// Queue-driven execution concurrency (`MAX_CONCURRENT`).
    pub max_concurrent: usize,
    /// Spawn depth ceiling (`MAX_SPAWN_DEPTH`).
    pub max_spawn_depth: u32,
    /// Agent used by `/api/chat` when none is named (`DEFAULT_AGENT`).
    pub default_agent: String,
    /// Run against the scripted mock LLM client (`QUILL_MOCK_LLM=1`).
    pub use_mock_llm: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3333,
            vault_path: PathBuf::from("sample-vault"),
            api_key: None,
            cors_origins: Vec::new(),
            max_message_bytes: 102_400,
            max_concurrent: 1,
            max_spawn_depth: 2,
            default_agent: "agents/assistant.md".to_string(),
            use_mock_llm: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("HOST", defaults.host),
            port: env_parsed("PORT", defaults.port),
            vault_path: std::env::var("VAULT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.vault_path),
            api_key: std::env::var("QUILL_API_KEY").ok().filter(|k| !k.is_empty()),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            max_message_bytes: env_parsed("MAX_MESSAGE_SIZE", defaults.max_message_bytes),
            max_concurrent: env_parsed("MAX_CONCURRENT", defaults.max_concurrent).max(1),
            max_spawn_depth: env_parsed("MAX_SPAWN_DEPTH", defaults.max_spawn_depth),
            default_agent: env_or("DEFAULT_AGENT", defaults.default_agent),
            use_mock_llm: std::env::var("QUILL_MOCK_LLM").map(|v| v == "1").unwrap_or(false),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
