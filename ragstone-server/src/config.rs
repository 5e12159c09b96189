// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Ragstone server configuration.
///
/// The recognized option set is closed: unknown keys in the config file are
/// logged once at startup and ignored, never silently accepted as tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub intent: IntentConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root under which each KB keeps its working directory.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    #[serde(default = "default_qa_storage_dir")]
    pub qa_storage_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_api_base")]
    pub llm_api_base: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Seconds.
    #[serde(default = "default_upstream_timeout")]
    pub llm_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_api_base")]
    pub embedding_api_base: String,
    #[serde(default)]
    pub embedding_api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Seconds.
    #[serde(default = "default_upstream_timeout")]
    pub embedding_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub rerank_enabled: bool,
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
    /// Seconds.
    #[serde(default = "default_upstream_timeout")]
    pub rerank_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enable_cache: bool,
    /// Seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Per-cache byte budgets in megabytes, keyed by cache name; caches
    /// not named here take the default budget.
    #[serde(default)]
    pub per_cache_size_limits: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub enable_proxy_headers: bool,
    /// CIDR blocks whose forwarded/user headers are honored.
    #[serde(default = "default_trusted_proxies")]
    pub trusted_proxy_ips: Vec<String>,
    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,
    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,
    #[serde(default = "default_user_tier_header")]
    pub user_tier_header: String,
    /// Requests per window for the `default` tier.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: u32,
    /// Window length in seconds.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window: u64,
    /// Tier name → requests per window. `default` here overrides
    /// `rate_limit_requests`.
    #[serde(default)]
    pub rate_limit_tiers: BTreeMap<String, u32>,
    /// Minimum seconds between accepted requests of one identity. Zero
    /// disables the check.
    #[serde(default)]
    pub min_interval_per_user: f64,
    /// Bound on the bucket table; least-recently-touched buckets are
    /// evicted past it.
    #[serde(default = "default_max_tracked_identities")]
    pub max_tracked_identities: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
    #[serde(default = "default_allowed_file_types")]
    pub allowed_file_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntentConfig {
    #[serde(default = "default_intent_confidence")]
    pub intent_confidence_threshold: f64,
    #[serde(default = "default_true")]
    pub intent_enable_llm: bool,
    /// File or directory of newline-separated sensitive words.
    #[serde(default)]
    pub intent_sensitive_vocabulary_path: Option<PathBuf>,
    /// System-wide QA similarity threshold; per-request `min_similarity`
    /// overrides it.
    #[serde(default = "default_qa_similarity")]
    pub qa_similarity_threshold: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8002
}
fn default_workers() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_working_dir() -> PathBuf {
    PathBuf::from("./knowledge_bases")
}
fn default_qa_storage_dir() -> PathBuf {
    PathBuf::from("./qa_storage")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_llm_api_base() -> String {
    "http://localhost:8100/v1".to_string()
}
fn default_llm_model() -> String {
    "qwen14b".to_string()
}
fn default_embedding_api_base() -> String {
    "http://localhost:8200/v1".to_string()
}
fn default_embedding_model() -> String {
    "embedding_qwen".to_string()
}
fn default_embedding_dim() -> usize {
    1024
}
fn default_rerank_model() -> String {
    "rerank-multilingual-v3.0".to_string()
}
fn default_upstream_timeout() -> u64 {
    240
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_trusted_proxies() -> Vec<String> {
    vec!["127.0.0.1/32".to_string(), "::1/128".to_string()]
}
fn default_user_id_header() -> String {
    "X-User-Id".to_string()
}
fn default_client_id_header() -> String {
    "X-Client-Id".to_string()
}
fn default_user_tier_header() -> String {
    "X-User-Tier".to_string()
}
fn default_rate_limit_requests() -> u32 {
    100
}
fn default_rate_limit_window() -> u64 {
    60
}
fn default_max_tracked_identities() -> u64 {
    100_000
}
fn default_max_file_size() -> usize {
    50 * 1024 * 1024
}
fn default_allowed_file_types() -> Vec<String> {
    [".txt", ".pdf", ".docx", ".doc", ".md", ".json", ".xml", ".csv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_intent_confidence() -> f64 {
    0.6
}
fn default_qa_similarity() -> f64 {
    0.98
}

impl Default for HttpConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for StorageConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for LlmConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for EmbeddingConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for RerankConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for CacheConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for GateConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for UploadConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for IntentConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults")
    }
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: HttpConfig::default(),
            storage: StorageConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            rerank: RerankConfig::default(),
            cache: CacheConfig::default(),
            gate: GateConfig::default(),
            upload: UploadConfig::default(),
            intent: IntentConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration with priority: file > env > defaults. The file
    /// wins for every key it sets; environment variables only fill in
    /// keys the file left to their defaults.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut file_value: Option<toml::Value> = None;
        let mut config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                let content = std::fs::read_to_string(&path)?;
                let value: toml::Value = toml::from_str(&content)?;
                warn_unknown_keys(&value);
                let config: Self = value.clone().try_into()?;
                file_value = Some(value);
                config
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.merge_env(file_value.as_ref());
        Ok(config)
    }

    /// Parse a TOML config file, warning once per unrecognized key.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let value: toml::Value = toml::from_str(&content)?;
        warn_unknown_keys(&value);
        let config: Self = value.try_into()?;
        Ok(config)
    }

    /// Environment overrides for the deployment-sensitive knobs. A
    /// variable only applies when the config file did not set the
    /// corresponding key, keeping file > env > defaults.
    fn merge_env(&mut self, file: Option<&toml::Value>) {
        let file_sets = |section: &str, key: &str| {
            file.and_then(|value| value.get(section))
                .and_then(|section| section.get(key))
                .is_some()
        };

        if !file_sets("server", "host") {
            if let Ok(host) = std::env::var("RAGSTONE_HOST") {
                self.server.host = host;
            }
        }
        if !file_sets("server", "port") {
            if let Ok(port) = std::env::var("RAGSTONE_PORT") {
                if let Ok(port) = port.parse() {
                    self.server.port = port;
                }
            }
        }
        if !file_sets("storage", "working_dir") {
            if let Ok(dir) = std::env::var("RAGSTONE_WORKING_DIR") {
                self.storage.working_dir = PathBuf::from(dir);
            }
        }
        if !file_sets("storage", "qa_storage_dir") {
            if let Ok(dir) = std::env::var("RAGSTONE_QA_STORAGE_DIR") {
                self.storage.qa_storage_dir = PathBuf::from(dir);
            }
        }
        if !file_sets("llm", "llm_api_base") {
            if let Ok(base) = std::env::var("RAGSTONE_LLM_API_BASE") {
                self.llm.llm_api_base = base;
            }
        }
        if !file_sets("llm", "llm_api_key") {
            if let Ok(key) = std::env::var("RAGSTONE_LLM_API_KEY") {
                self.llm.llm_api_key = Some(key);
            }
        }
        if !file_sets("embedding", "embedding_api_base") {
            if let Ok(base) = std::env::var("RAGSTONE_EMBEDDING_API_BASE") {
                self.embedding.embedding_api_base = base;
            }
        }
        if !file_sets("embedding", "embedding_api_key") {
            if let Ok(key) = std::env::var("RAGSTONE_EMBEDDING_API_KEY") {
                self.embedding.embedding_api_key = Some(key);
            }
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.server.host, self.server.port).parse()?)
    }

    /// Effective per-tier quota map: config tiers over the `default`
    /// fallback.
    pub fn tier_limits(&self) -> BTreeMap<String, u32> {
        let mut tiers = self.gate.rate_limit_tiers.clone();
        tiers
            .entry("default".to_string())
            .or_insert(self.gate.rate_limit_requests);
        tiers
    }

    /// Validate before serving; a failure here exits with code 1.
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.server.port == 0 {
            anyhow::bail!("port must be non-zero");
        }
        if self.embedding.embedding_dim == 0 {
            anyhow::bail!("embedding_dim must be non-zero");
        }
        if !self.llm.llm_api_base.starts_with("http://")
            && !self.llm.llm_api_base.starts_with("https://")
        {
            anyhow::bail!("llm_api_base is not an HTTP URL: {}", self.llm.llm_api_base);
        }
        if !self.embedding.embedding_api_base.starts_with("http://")
            && !self.embedding.embedding_api_base.starts_with("https://")
        {
            anyhow::bail!(
                "embedding_api_base is not an HTTP URL: {}",
                self.embedding.embedding_api_base
            );
        }
        if self.gate.min_interval_per_user < 0.0 {
            anyhow::bail!("min_interval_per_user must not be negative");
        }
        if self.upload.max_file_size == 0 {
            anyhow::bail!("max_file_size must be greater than 0");
        }

        for dir in [
            &self.storage.working_dir,
            &self.storage.qa_storage_dir,
            &self.storage.log_dir,
            &self.storage.upload_dir,
        ] {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

/// Log keys the config struct does not recognize. Top-level tables and
/// their immediate children cover the whole recognized set.
fn warn_unknown_keys(value: &toml::Value) {
    let known: BTreeSet<&str> = [
        "server", "storage", "llm", "embedding", "rerank", "cache", "gate", "upload", "intent",
    ]
    .into();
    let known_fields: BTreeSet<&str> = [
        "host", "port", "workers", "debug", "enable_cors", "cors_origins",
        "working_dir", "qa_storage_dir", "log_dir", "upload_dir",
        "llm_api_base", "llm_api_key", "llm_model", "llm_timeout",
        "embedding_api_base", "embedding_api_key", "embedding_model", "embedding_dim",
        "embedding_timeout",
        "rerank_enabled", "rerank_model", "rerank_timeout",
        "enable_cache", "cache_ttl", "per_cache_size_limits",
        "enable_proxy_headers", "trusted_proxy_ips", "user_id_header", "client_id_header",
        "user_tier_header", "rate_limit_requests", "rate_limit_window", "rate_limit_tiers",
        "min_interval_per_user", "max_tracked_identities",
        "max_file_size", "allowed_file_types",
        "intent_confidence_threshold", "intent_enable_llm", "intent_sensitive_vocabulary_path",
        "qa_similarity_threshold",
    ]
    .into();

    if let Some(table) = value.as_table() {
        for (section, body) in table {
            if !known.contains(section.as_str()) {
                tracing::warn!("Ignoring unknown config section: {}", section);
                continue;
            }
            if let Some(fields) = body.as_table() {
                for key in fields.keys() {
                    if !known_fields.contains(key.as_str()) {
                        tracing::warn!("Ignoring unknown config option: {}.{}", section, key);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = ServerConfig::default();
        config.storage.working_dir = dir.path().join("kb");
        config.storage.qa_storage_dir = dir.path().join("qa");
        config.storage.log_dir = dir.path().join("logs");
        config.storage.upload_dir = dir.path().join("uploads");
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8002);
        assert_eq!(config.intent.qa_similarity_threshold, 0.98);
    }

    #[test]
    fn test_tier_limits_include_default() {
        let mut config = ServerConfig::default();
        config.gate.rate_limit_requests = 42;
        config.gate.rate_limit_tiers.insert("pro".into(), 1000);
        let tiers = config.tier_limits();
        assert_eq!(tiers["default"], 42);
        assert_eq!(tiers["pro"], 1000);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [gate]
            min_interval_per_user = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.gate.min_interval_per_user, 0.5);
        assert_eq!(config.gate.user_id_header, "X-User-Id");
    }

    #[test]
    fn test_invalid_api_base_fails_validation() {
        let mut config = ServerConfig::default();
        config.llm.llm_api_base = "not-a-url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_beats_env_beats_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ragstone.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            host = "1.2.3.4"
            "#,
        )
        .unwrap();

        // Host is set by the file and must win; port is not, so the
        // environment fills it in over the default.
        std::env::set_var("RAGSTONE_HOST", "9.9.9.9");
        std::env::set_var("RAGSTONE_PORT", "9100");

        let config = ServerConfig::load(Some(path)).unwrap();

        std::env::remove_var("RAGSTONE_HOST");
        std::env::remove_var("RAGSTONE_PORT");

        assert_eq!(config.server.host, "1.2.3.4");
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn test_env_applies_without_config_file() {
        std::env::set_var("RAGSTONE_QA_STORAGE_DIR", "/srv/qa");
        let config = ServerConfig::load(None).unwrap();
        std::env::remove_var("RAGSTONE_QA_STORAGE_DIR");
        assert_eq!(config.storage.qa_storage_dir, PathBuf::from("/srv/qa"));
    }
}
