use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MemoriaConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub identity: IdentityConfig,
    pub wrapper: WrapperConfig,
    pub indexer: IndexerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `http`, `local`, or `none`.
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    /// Full URL of the `/embeddings` endpoint (http provider).
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// `bearer` or `api-key`.
    pub auth_style: String,
    /// Directory holding `model.onnx` and `tokenizer.json` (local provider).
    pub cache_dir: String,
    pub max_chars: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub recent_limit: usize,
    pub vector_top_k: usize,
    pub max_context_items: usize,
    pub min_text_len: usize,
    pub rrf_k: usize,
    pub default_history_limit: usize,
    pub max_history_limit: usize,
    pub dedup_prefix_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: u64,
    pub memoria_ttl_secs: u64,
    pub thread_ttl_secs: u64,
    pub default_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IdentityConfig {
    pub upstream_enabled: bool,
    /// Whether we run on the agent host platform. `None` means auto-detect.
    pub hosted: Option<bool>,
    pub thread_api_url: Option<String>,
    pub thread_api_key: Option<String>,
    pub timeout_ms: u64,
    pub default_agent: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WrapperConfig {
    pub identity_budget_ms: u64,
    pub retrieval_budget_ms: u64,
    pub persist_budget_ms: u64,
    pub total_budget_ms: u64,
    pub deferred_writes: bool,
    pub max_response_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub min_index_chars: usize,
    pub vector_profile: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7071,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_memoria_dir()
            .join("memoria.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_memoria_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "http".into(),
            model: "text-embedding-3-large".into(),
            dimensions: 3072,
            endpoint: None,
            api_key: None,
            auth_style: "bearer".into(),
            cache_dir,
            max_chars: 8000,
            timeout_ms: 5000,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            recent_limit: 20,
            vector_top_k: 10,
            max_context_items: 30,
            min_text_len: 30,
            rrf_k: 60,
            default_history_limit: 20,
            max_history_limit: 100,
            dedup_prefix_chars: 100,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
            memoria_ttl_secs: 600,
            thread_ttl_secs: 86_400,
            default_ttl_secs: 600,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            upstream_enabled: false,
            hosted: None,
            thread_api_url: None,
            thread_api_key: None,
            timeout_ms: 2000,
            default_agent: "foundry_user".into(),
        }
    }
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            identity_budget_ms: 2000,
            retrieval_budget_ms: 3000,
            persist_budget_ms: 2000,
            total_budget_ms: 30_000,
            deferred_writes: false,
            max_response_bytes: 16 * 1024,
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 2000,
            batch_size: 64,
            min_index_chars: 30,
            vector_profile: "memoria-hnsw".into(),
        }
    }
}

impl IdentityConfig {
    /// Hosted runtime detection: explicit setting wins, otherwise the platform's
    /// instance marker in the environment.
    pub fn is_hosted(&self) -> bool {
        self.hosted
            .unwrap_or_else(|| std::env::var_os("WEBSITE_INSTANCE_ID").is_some())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl WrapperConfig {
    pub fn identity_budget(&self) -> Duration {
        Duration::from_millis(self.identity_budget_ms)
    }

    pub fn retrieval_budget(&self) -> Duration {
        Duration::from_millis(self.retrieval_budget_ms)
    }

    pub fn persist_budget(&self) -> Duration {
        Duration::from_millis(self.persist_budget_ms)
    }

    pub fn total_budget(&self) -> Duration {
        Duration::from_millis(self.total_budget_ms)
    }
}

/// Returns `~/.memoria/`
pub fn default_memoria_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memoria")
}

/// Returns the default config file path: `~/.memoria/config.toml`
pub fn default_config_path() -> PathBuf {
    default_memoria_dir().join("config.toml")
}

impl MemoriaConfig {
    /// Load config from the default TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemoriaConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMORIA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MEMORIA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MEMORIA_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid MEMORIA_PORT"),
            }
        }
        if let Ok(val) = std::env::var("MEMORIA_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(val);
        }
        if let Ok(val) = std::env::var("MEMORIA_EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = Some(val);
        }
        if let Ok(val) = std::env::var("MEMORIA_THREAD_API_KEY") {
            self.identity.thread_api_key = Some(val);
        }
        if let Ok(val) = std::env::var("MEMORIA_DEFERRED_WRITES") {
            self.wrapper.deferred_writes = matches!(val.as_str(), "1" | "true" | "yes");
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MemoriaConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.embedding.dimensions, 3072);
        assert_eq!(config.embedding.max_chars, 8000);
        assert_eq!(config.retrieval.recent_limit, 20);
        assert_eq!(config.retrieval.vector_top_k, 10);
        assert_eq!(config.retrieval.max_context_items, 30);
        assert_eq!(config.cache.memoria_ttl_secs, 600);
        assert_eq!(config.cache.thread_ttl_secs, 86_400);
        assert_eq!(config.identity.default_agent, "foundry_user");
        assert_eq!(config.wrapper.total_budget_ms, 30_000);
        assert!(!config.wrapper.deferred_writes);
        assert!(config.storage.db_path.ends_with("memoria.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"
port = 9000

[storage]
db_path = "/tmp/test.db"

[embedding]
provider = "none"
dimensions = 64

[wrapper]
deferred_writes = true
"#;
        let config: MemoriaConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.embedding.provider, "none");
        assert_eq!(config.embedding.dimensions, 64);
        assert!(config.wrapper.deferred_writes);
        // defaults still apply for unset fields
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.embedding.max_chars, 8000);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = MemoriaConfig::default();
        std::env::set_var("MEMORIA_DB", "/tmp/override.db");
        std::env::set_var("MEMORIA_LOG_LEVEL", "trace");
        std::env::set_var("MEMORIA_PORT", "8088");
        std::env::set_var("MEMORIA_DEFERRED_WRITES", "true");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.server.port, 8088);
        assert!(config.wrapper.deferred_writes);

        std::env::remove_var("MEMORIA_DB");
        std::env::remove_var("MEMORIA_LOG_LEVEL");
        std::env::remove_var("MEMORIA_PORT");
        std::env::remove_var("MEMORIA_DEFERRED_WRITES");
    }

    #[test]
    fn explicit_hosted_flag_wins() {
        let mut identity = IdentityConfig::default();
        identity.hosted = Some(true);
        assert!(identity.is_hosted());
        identity.hosted = Some(false);
        assert!(!identity.is_hosted());
    }

    #[test]
    fn tilde_expansion() {
        assert_eq!(expand_tilde("/abs/path.db"), PathBuf::from("/abs/path.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/x.db"), home.join("x.db"));
        }
    }
}
