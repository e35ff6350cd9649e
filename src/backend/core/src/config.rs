//! Configuration management.
//!
//! Process configuration comes from `SITEGATE__*` environment variables
//! (sections separated by `__`, e.g. `SITEGATE__DATABASE__URL`), optionally
//! layered over a config file. Resource guardrails are not part of this
//! structure; they are read from their own flat variables by
//! [`GuardrailConfig::from_env`](crate::guardrails::GuardrailConfig::from_env).

use serde::Deserialize;

use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "SITEGATE";
const ENV_SEPARATOR: &str = "__";

/// Main worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Artifact storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Background loop configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Logging and metrics configuration
    #[serde(default)]
    pub observability: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    /// Apply the export job migrations at startup
    #[serde(default)]
    pub run_migrations: bool,
}

/// Which storage backend holds artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Local,
    Object,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Root directory of the local backend
    #[serde(default = "default_local_root")]
    pub local_root: String,

    /// Base URL of the object store
    pub object_endpoint: Option<String>,

    pub object_bucket: Option<String>,

    /// Bearer token for the object store
    pub object_token: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            local_root: default_local_root(),
            object_endpoint: None,
            object_bucket: None,
            object_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between export runner ticks
    #[serde(default = "default_export_poll_interval_secs")]
    pub export_poll_interval_secs: u64,

    /// Seconds between retention sweeps
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,

    /// Sweep once immediately at startup
    #[serde(default)]
    pub run_retention_on_start: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            export_poll_interval_secs: default_export_poll_interval_secs(),
            retention_interval_secs: default_retention_interval_secs(),
            run_retention_on_start: false,
        }
    }
}

impl WorkerConfig {
    pub fn export_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.export_poll_interval_secs.max(1))
    }

    pub fn retention_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.retention_interval_secs.max(1))
    }
}

// Default value functions
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_acquire_timeout_secs() -> u64 { 5 }
fn default_local_root() -> String { "./storage".to_string() }
fn default_export_poll_interval_secs() -> u64 { 5 }
fn default_retention_interval_secs() -> u64 { 86_400 }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a config file, with the environment taking precedence.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}
