//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from an optional TOML file. Every key has a
//! built-in default, so a missing file only produces a warning. Settings that
//! cannot be expressed sensibly (zero workers, a bucket narrower than a
//! minute, ...) are rejected by [`TomlConfig::validate`].

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "PLAYTRACK_ROOT_FOLDER";

/// Environment variable naming the TOML configuration file
pub const CONFIG_FILE_ENV: &str = "PLAYTRACK_CONFIG";

/// Event store database file name inside the root folder
pub const EVENT_DB_FILE: &str = "playtrack.db";

/// Consumer write-ahead log database file name inside the root folder
pub const WAL_DB_FILE: &str = "consumer_wal.db";

/// Root folder resolution, highest priority first:
/// 1. Command-line argument
/// 2. `PLAYTRACK_ROOT_FOLDER` environment variable
/// 3. `root_folder` from the TOML config
/// 4. OS-dependent compiled default
#[derive(Debug, Clone, Default)]
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml_value(mut self, path: Option<PathBuf>) -> Self {
        self.toml_value = path;
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        default_root_folder()
    }
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/playtrack (or /var/lib/playtrack for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("playtrack"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/playtrack"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("playtrack"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/playtrack"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("playtrack"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\playtrack"))
    } else {
        PathBuf::from("./playtrack_data")
    }
}

/// Default configuration file path for the platform (`~/.config/playtrack/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("playtrack").join("config.toml"))
}

/// Creates the root folder and hands out the database paths inside it
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root)?;
            info!("Created root folder: {}", self.root.display());
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(EVENT_DB_FILE)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.root.join(WAL_DB_FILE)
    }
}

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub correlation: CorrelationConfig,
    pub cache: CacheConfig,
    pub broker: BrokerConfig,
    pub workers: WorkerConfig,
    pub storage: StorageConfig,
    pub wal: WalConfig,
    pub dead_letter: DeadLetterConfig,
    pub audit: AuditConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Width of the time bucket embedded in correlation keys
    pub time_bucket_secs: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            time_bucket_secs: 300,
        }
    }
}

/// L1 exact-match cache settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
    /// Treat a repeated source session key as a duplicate (off: sessions resume legitimately)
    pub session_key_dedup: bool,
    pub cross_source_dedup: bool,
    pub cross_source_min_similarity: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl_secs: 1_800,
            session_key_dedup: false,
            cross_source_dedup: true,
            cross_source_min_similarity: 0.8,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long the broker remembers a transaction id for publish dedup
    pub dedup_window_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent consumer tasks; the broker is partitioned one partition per worker
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { count: 4 }
    }
}

/// Storage write retry policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Attempts across restarts before an entry is abandoned
    pub max_replay_attempts: u32,
    pub retry_interval_secs: u64,
    pub applied_retention_hours: u64,
    /// Unapplied entries older than this are dead-lettered instead of replayed
    pub entry_ttl_hours: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            max_replay_attempts: 10,
            retry_interval_secs: 30,
            applied_retention_hours: 168,
            entry_ttl_hours: 168,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub max_retries: u32,
    pub retry_interval_secs: u64,
    /// Linear per-retry delay, capped at one hour
    pub retry_backoff_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_interval_secs: 60,
            retry_backoff_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Keep the discarded payload so the decision can be reversed
    pub store_raw_payload: bool,
    pub retention_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            store_raw_payload: true,
            retention_days: 90,
        }
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// Reject values the pipeline cannot operate with
    pub fn validate(&self) -> Result<()> {
        let bucket = self.correlation.time_bucket_secs;
        if bucket < 60 || bucket % 60 != 0 {
            return Err(Error::Config(format!(
                "correlation.time_bucket_secs must be a positive multiple of 60, got {}",
                bucket
            )));
        }
        if self.cache.capacity == 0 {
            return Err(Error::Config("cache.capacity must be greater than 0".to_string()));
        }
        if self.cache.ttl_secs == 0 {
            return Err(Error::Config("cache.ttl_secs must be greater than 0".to_string()));
        }
        let similarity = self.cache.cross_source_min_similarity;
        if !(0.0..=1.0).contains(&similarity) {
            return Err(Error::Config(format!(
                "cache.cross_source_min_similarity must be within [0, 1], got {}",
                similarity
            )));
        }
        if self.workers.count == 0 {
            return Err(Error::Config("workers.count must be greater than 0".to_string()));
        }
        if self.storage.max_attempts == 0 {
            return Err(Error::Config("storage.max_attempts must be greater than 0".to_string()));
        }
        if self.storage.initial_backoff_ms > self.storage.max_backoff_ms {
            return Err(Error::Config(
                "storage.initial_backoff_ms must not exceed storage.max_backoff_ms".to_string(),
            ));
        }
        if self.wal.max_replay_attempts == 0 {
            return Err(Error::Config("wal.max_replay_attempts must be greater than 0".to_string()));
        }
        if self.wal.entry_ttl_hours == 0 {
            return Err(Error::Config("wal.entry_ttl_hours must be greater than 0".to_string()));
        }
        if self.dead_letter.max_retries == 0 {
            return Err(Error::Config("dead_letter.max_retries must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// Load bootstrap configuration.
///
/// A missing file is not fatal: a warning is logged and built-in defaults are
/// used. A file that exists but does not parse is an error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        return Ok(TomlConfig::default());
    }

    let text = std::fs::read_to_string(path)?;
    let config = TomlConfig::from_toml_str(&text)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}
