//! Configuration parsing and validation.
//!
//! Configuration is assembled from three layers: built-in defaults, an
//! optional config file (YAML, or TOML when the file name ends in `.toml`)
//! and command-line overrides. Only the merged result is validated, so a
//! flag can correct a value the file got wrong.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::{ServerError, ServerResult};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/k8s/config.yaml";

/// Default root for persisted state.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/k8s";

/// External etcd endpoint used in HA mode when none is configured.
pub const DEFAULT_EXTERNAL_ENDPOINT: &str = "http://127.0.0.1:2379";

/// etcd release the embedded store reports itself as.
pub const DEFAULT_EMULATED_ETCD_VERSION: &str = "3.5.13";

/// Deployment mode. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Single node with the embedded SQLite-backed store.
    Single,
    /// Storage delegated to an external etcd cluster.
    Ha,
}

impl DeploymentMode {
    /// Flag/config spelling of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Ha => "ha",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "ha" => Ok(Self::Ha),
            other => Err(ServerError::InvalidMode {
                value: other.to_string(),
            }),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Process-level settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend settings.
    #[serde(default)]
    pub storage: StorageSection,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Mode: "single" or "ha".
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Root directory for persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Storage backend settings as written in the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    /// Explicit SQLite database file for single mode.
    #[serde(default)]
    pub sqlite_path: Option<String>,

    /// External etcd endpoints for HA mode. The first one is used.
    #[serde(default)]
    pub etcd_servers: Vec<String>,

    /// Embedded store tuning.
    #[serde(default)]
    pub embedded: EmbeddedConfig,
}

/// Embedded store tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    /// Idle connections kept in the SQLite pool.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: u32,

    /// Maximum open connections; 0 means unlimited.
    #[serde(default)]
    pub max_open_connections: u32,

    /// Connection lifetime in seconds; 0 means unlimited.
    #[serde(default)]
    pub connection_max_lifetime_secs: u64,

    /// Open SQLite connections in shared-cache mode.
    #[serde(default = "default_true")]
    pub shared_cache: bool,

    /// Watch progress notification interval in milliseconds.
    #[serde(default = "default_notify_interval_ms")]
    pub notify_interval_ms: u64,

    /// Interval at which the watch poller checks for new revisions.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between expired lease sweeps.
    #[serde(default = "default_lease_sweep_interval_ms")]
    pub lease_sweep_interval_ms: u64,

    /// Interval between automatic compactions; 0 disables them.
    #[serde(default = "default_compact_interval_secs")]
    pub compact_interval_secs: u64,

    /// Revisions kept behind the current revision by automatic compaction.
    #[serde(default = "default_compact_min_retain")]
    pub compact_min_retain: i64,

    /// etcd version reported by the Maintenance API.
    #[serde(default = "default_emulated_etcd_version")]
    pub emulated_etcd_version: String,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: default_max_idle_connections(),
            max_open_connections: 0,
            connection_max_lifetime_secs: 0,
            shared_cache: true,
            notify_interval_ms: default_notify_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_sweep_interval_ms: default_lease_sweep_interval_ms(),
            compact_interval_secs: default_compact_interval_secs(),
            compact_min_retain: default_compact_min_retain(),
            emulated_etcd_version: default_emulated_etcd_version(),
        }
    }
}

impl EmbeddedConfig {
    /// Watch progress notification interval.
    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }

    /// Watch poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lease sweep interval.
    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lease_sweep_interval_ms)
    }

    /// Automatic compaction interval, `None` when disabled.
    pub fn compact_interval(&self) -> Option<Duration> {
        (self.compact_interval_secs > 0).then(|| Duration::from_secs(self.compact_interval_secs))
    }

    /// Connection lifetime, `None` when unlimited.
    pub fn connection_max_lifetime(&self) -> Option<Duration> {
        (self.connection_max_lifetime_secs > 0)
            .then(|| Duration::from_secs(self.connection_max_lifetime_secs))
    }
}

// Default value functions

fn default_mode() -> String {
    DeploymentMode::Single.as_str().to_string()
}

fn default_data_dir() -> String {
    DEFAULT_DATA_DIR.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_idle_connections() -> u32 {
    2
}

fn default_notify_interval_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_lease_sweep_interval_ms() -> u64 {
    1_000
}

fn default_compact_interval_secs() -> u64 {
    300
}

fn default_compact_min_retain() -> i64 {
    1_000
}

fn default_emulated_etcd_version() -> String {
    DEFAULT_EMULATED_ETCD_VERSION.to_string()
}

/// Storage settings after validation. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Active deployment mode.
    pub mode: DeploymentMode,
    /// Root directory for persisted state.
    pub data_dir: PathBuf,
    /// Explicit SQLite database file.
    pub sqlite_path: Option<PathBuf>,
    /// External etcd endpoints.
    pub etcd_servers: Vec<String>,
    /// Embedded store tuning.
    pub embedded: EmbeddedConfig,
}

impl StorageConfig {
    /// Storage settings for `mode` rooted at `data_dir` with default tuning.
    pub fn new(mode: DeploymentMode, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            data_dir: data_dir.into(),
            sqlite_path: None,
            etcd_servers: Vec::new(),
            embedded: EmbeddedConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or TOML file and validate it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config = Self::parse_yaml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the effective configuration: file (when present) then overrides.
    ///
    /// A missing file is not an error; the default path usually does not
    /// exist on fresh nodes.
    pub fn load(path: &Path, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = if path.exists() {
            Self::parse_file(path)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))
        } else {
            Self::parse_yaml(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))
        }
    }

    fn parse_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).with_context(|| "failed to parse config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref mode) = overrides.server_mode {
            self.server.mode = mode.clone();
        }
        if let Some(ref data_dir) = overrides.data_dir {
            self.server.data_dir = data_dir.clone();
        }
        if let Some(ref log_level) = overrides.log_level {
            self.server.log_level = log_level.clone();
        }
        if let Some(ref sqlite_path) = overrides.sqlite_path {
            self.storage.sqlite_path = Some(sqlite_path.clone());
        }
        if let Some(ref servers) = overrides.etcd_servers {
            self.storage.etcd_servers = servers.clone();
        }
    }

    /// Validate configuration consistency.
    ///
    /// The log level is deliberately not checked here; an unknown level is
    /// downgraded to `info` with a warning by [`resolve_log_level`].
    pub fn validate(&self) -> ServerResult<()> {
        self.mode()?;
        self.validate_server()?;
        self.validate_embedded()?;
        Ok(())
    }

    fn validate_server(&self) -> ServerResult<()> {
        if self.server.data_dir.trim().is_empty() {
            return Err(invalid("server.data_dir must not be empty"));
        }
        if let Some(ref path) = self.storage.sqlite_path {
            if path.trim().is_empty() {
                return Err(invalid("storage.sqlite_path must not be empty when set"));
            }
        }
        if self.storage.etcd_servers.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("storage.etcd_servers must not contain empty entries"));
        }
        Ok(())
    }

    fn validate_embedded(&self) -> ServerResult<()> {
        let embedded = &self.storage.embedded;
        if embedded.notify_interval_ms == 0 {
            return Err(invalid("storage.embedded.notify_interval_ms must be > 0"));
        }
        if embedded.poll_interval_ms == 0 {
            return Err(invalid("storage.embedded.poll_interval_ms must be > 0"));
        }
        if embedded.lease_sweep_interval_ms == 0 {
            return Err(invalid("storage.embedded.lease_sweep_interval_ms must be > 0"));
        }
        if embedded.compact_min_retain < 0 {
            return Err(invalid("storage.embedded.compact_min_retain must be >= 0"));
        }
        if embedded.max_open_connections != 0
            && embedded.max_idle_connections > embedded.max_open_connections
        {
            return Err(invalid(format!(
                "storage.embedded.max_idle_connections ({}) cannot exceed max_open_connections ({})",
                embedded.max_idle_connections, embedded.max_open_connections
            )));
        }
        if embedded.emulated_etcd_version.trim().is_empty() {
            return Err(invalid("storage.embedded.emulated_etcd_version must not be empty"));
        }
        Ok(())
    }

    /// Parsed deployment mode.
    pub fn mode(&self) -> ServerResult<DeploymentMode> {
        self.server.mode.parse()
    }

    /// Data directory as a path.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.data_dir)
    }

    /// Build the read-only storage settings.
    pub fn storage_config(&self) -> ServerResult<StorageConfig> {
        Ok(StorageConfig {
            mode: self.mode()?,
            data_dir: self.data_dir(),
            sqlite_path: self.storage.sqlite_path.as_ref().map(PathBuf::from),
            etcd_servers: self.storage.etcd_servers.clone(),
            embedded: self.storage.embedded.clone(),
        })
    }
}

fn invalid(message: impl Into<String>) -> ServerError {
    ServerError::InvalidConfig {
        message: message.into(),
    }
}

/// Resolve a textual log level.
///
/// Returns the level and whether the input was recognised; unknown input
/// falls back to `INFO`.
pub fn resolve_log_level(value: &str) -> (tracing::Level, bool) {
    match value.trim().to_ascii_lowercase().as_str() {
        "trace" => (tracing::Level::TRACE, true),
        "debug" => (tracing::Level::DEBUG, true),
        "info" => (tracing::Level::INFO, true),
        "warn" | "warning" => (tracing::Level::WARN, true),
        "error" => (tracing::Level::ERROR, true),
        _ => (tracing::Level::INFO, false),
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override deployment mode.
    pub server_mode: Option<String>,
    /// Override data directory.
    pub data_dir: Option<String>,
    /// Override log level.
    pub log_level: Option<String>,
    /// Override SQLite database path.
    pub sqlite_path: Option<String>,
    /// Override external etcd endpoints.
    pub etcd_servers: Option<Vec<String>>,
}
