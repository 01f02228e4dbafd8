//! Configuration: storage directory, collector endpoint, retry tuning.
//!
//! Resolution order per setting is environment variable, then the optional
//! `runledger.toml` in the data directory, then the built-in default. Exactly
//! one canonical variable resolves each setting; the single legacy alias
//! (`RUNLEDGER_HOME` for the data directory) is consulted only when the
//! canonical `RUNLEDGER_DATA_DIR` is unset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Canonical environment variable for the base storage directory.
pub const ENV_DATA_DIR: &str = "RUNLEDGER_DATA_DIR";
/// Legacy alias, honored only when [`ENV_DATA_DIR`] is unset.
pub const ENV_DATA_DIR_LEGACY: &str = "RUNLEDGER_HOME";
/// Canonical environment variable for the remote collector URL.
pub const ENV_COLLECTOR_URL: &str = "RUNLEDGER_COLLECTOR_URL";

/// Fixed file layout under the data directory.
pub const APPEND_LOG_FILE: &str = "events.log";
pub const DB_FILE: &str = "runs.db";
pub const BACKUPS_DIR: &str = "backups";
pub const LOCK_FILE: &str = "runledger.lock";
pub const CONFIG_FILE: &str = "runledger.toml";

/// Sync forwarder tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between scans for undelivered runs.
    pub poll_interval_secs: u64,
    /// Initial backoff after a failed delivery, in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff ceiling, in seconds.
    pub max_delay_secs: u64,
    /// Retry ceiling per run; exhausted runs stay queryable locally.
    pub max_attempts: i64,
    /// Per-attempt network timeout, in seconds.
    pub attempt_timeout_secs: u64,
    /// Maximum runs fetched per scan.
    pub batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            initial_delay_ms: 1_000,
            max_delay_secs: 300,
            max_attempts: 10,
            attempt_timeout_secs: 15,
            batch_size: 50,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Top-level runledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Base storage directory; the append log, indexed store, and backups
    /// live in fixed subpaths beneath it.
    pub data_dir: PathBuf,
    /// Remote collector base URL; `None` disables forwarding.
    pub collector_url: Option<String>,
    /// Query service bind address.
    pub listen_addr: String,
    /// Bounded wait for the host-level append lock, in seconds.
    pub lock_timeout_secs: u64,
    pub sync: SyncConfig,
    pub log: LogConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            collector_url: None,
            listen_addr: "127.0.0.1:8787".to_string(),
            lock_timeout_secs: 10,
            sync: SyncConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl LedgerConfig {
    /// Resolve configuration from the environment and the optional config
    /// file in the data directory.
    pub fn load() -> Result<Self, ConfigError> {
        let data_dir = resolve_data_dir();
        let mut config = Self::from_file_or_default(&data_dir.join(CONFIG_FILE))?;
        config.data_dir = data_dir;
        if let Ok(url) = std::env::var(ENV_COLLECTOR_URL) {
            if !url.trim().is_empty() {
                config.collector_url = Some(url);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file, falling back to defaults when the
    /// file does not exist.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        if self.sync.max_attempts < 1 {
            return Err(ConfigError::Invalid("sync.max_attempts must be >= 1".into()));
        }
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid("sync.batch_size must be >= 1".into()));
        }
        if let Some(url) = &self.collector_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "collector_url must be an http(s) URL, got {url}"
                )));
            }
        }
        Ok(())
    }

    /// Create the data directory and the backups subdirectory.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }

    #[must_use]
    pub fn append_log_path(&self) -> PathBuf {
        self.data_dir.join(APPEND_LOG_FILE)
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join(BACKUPS_DIR)
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Canonical variable wins; the legacy alias is consulted only when it is
/// unset; otherwise the platform default.
fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(dir) = std::env::var(ENV_DATA_DIR_LEGACY) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    default_data_dir()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runledger")
}
