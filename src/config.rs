//! Configuration loading and types for ChunkStore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, metadata persistence, object storage, quotas,
//! and name sanitization.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Object storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Per-owner storage quotas.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Object name rules.
    #[serde(default)]
    pub naming: NamingConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probes).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Largest accepted chunk body in bytes (default 8 MiB).
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection and the health probe.
/// Both are enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Enable the `/health` probe.
    #[serde(default = "default_true")]
    pub health_check: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            health_check: true,
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Backend type: `sqlite` or `memory`.
    #[serde(default = "default_metadata_engine")]
    pub engine: String,

    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            engine: default_metadata_engine(),
            sqlite: SqliteConfig::default(),
        }
    }
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `memory` or `azure`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Memory storage configuration.
    #[serde(default)]
    pub memory: MemoryStorageConfig,

    /// Azure Blob Storage configuration.
    #[serde(default)]
    pub azure: Option<AzureStorageConfig>,

    /// Per-operation deadlines for backend calls.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            memory: MemoryStorageConfig::default(),
            azure: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Memory storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryStorageConfig {
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
    /// Size of each chunk yielded by reads.
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 0,
            read_chunk_bytes: default_read_chunk_bytes(),
        }
    }
}

/// Azure Blob Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AzureStorageConfig {
    /// Backing Azure container name.
    pub container: String,
    /// Azure storage account name.
    pub account: String,
    /// Key prefix in the backing container.
    #[serde(default)]
    pub prefix: String,
    /// SAS token used instead of the account key when set.
    #[serde(default)]
    pub sas_token: String,
    /// Custom endpoint (e.g. Azurite). Defaults to the public blob endpoint.
    #[serde(default)]
    pub endpoint: String,
}

/// Deadlines applied by the block stager, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_stage_timeout")]
    pub stage_seconds: u64,
    #[serde(default = "default_commit_timeout")]
    pub commit_seconds: u64,
    #[serde(default = "default_read_timeout")]
    pub read_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            stage_seconds: default_stage_timeout(),
            commit_seconds: default_commit_timeout(),
            read_seconds: default_read_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn stage(&self) -> Duration {
        Duration::from_secs(self.stage_seconds)
    }

    pub fn commit(&self) -> Duration {
        Duration::from_secs(self.commit_seconds)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_seconds)
    }
}

/// Quota configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Quota assigned to an owner the first time they are seen (default 1 GiB).
    #[serde(default = "default_quota_bytes")]
    pub default_quota_bytes: u64,

    /// Per-owner overrides applied when the owner's quota row is created.
    #[serde(default)]
    pub owners: HashMap<String, u64>,

    /// Rebuild every owner's `used_bytes` from their objects at startup.
    #[serde(default = "default_true")]
    pub recompute_on_startup: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_quota_bytes: default_quota_bytes(),
            owners: HashMap::new(),
            recompute_on_startup: true,
        }
    }
}

/// Object name rules of the storage backend.
#[derive(Debug, Clone, Deserialize)]
pub struct NamingConfig {
    /// Maximum name length in characters.
    #[serde(default = "default_max_name_length")]
    pub max_length: usize,

    /// Characters stripped from the end of a name.
    #[serde(default = "default_forbidden_trailing")]
    pub forbidden_trailing: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_name_length(),
            forbidden_trailing: default_forbidden_trailing(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9013
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_chunk_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_metadata_engine() -> String {
    "sqlite".to_string()
}

fn default_metadata_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_read_chunk_bytes() -> usize {
    64 * 1024
}

fn default_stage_timeout() -> u64 {
    30
}

fn default_commit_timeout() -> u64 {
    60
}

fn default_read_timeout() -> u64 {
    30
}

fn default_quota_bytes() -> u64 {
    1_073_741_824 // 1 GiB
}

fn default_max_name_length() -> usize {
    1024
}

fn default_forbidden_trailing() -> String {
    "./\\".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 9013);
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.naming.max_length, 1024);
        assert_eq!(config.naming.forbidden_trailing, "./\\");
        assert_eq!(config.quota.default_quota_bytes, 1_073_741_824);
        assert!(config.quota.recompute_on_startup);
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
server:
  port: 8080
storage:
  backend: azure
  azure:
    container: uploads
    account: acct
  timeouts:
    commit_seconds: 5
quota:
  default_quota_bytes: 1048576
  owners:
    alice: 2097152
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        let azure = config.storage.azure.unwrap();
        assert_eq!(azure.container, "uploads");
        assert_eq!(azure.prefix, "");
        assert_eq!(config.storage.timeouts.commit(), Duration::from_secs(5));
        assert_eq!(config.storage.timeouts.stage(), Duration::from_secs(30));
        assert_eq!(config.quota.owners.get("alice"), Some(&2_097_152));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunkstore.yaml");
        std::fs::write(&path, "metadata:\n  engine: memory\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.metadata.engine, "memory");
        assert_eq!(config.metadata.sqlite.path, "./data/metadata.db");
    }
}
