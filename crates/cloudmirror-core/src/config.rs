//! Configuration module for CloudMirror.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for CloudMirror.
///
/// Missing sections or fields fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub retry: RetryConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Where the snapshot of the mirror is published.
    pub snapshot_path: PathBuf,
    /// Sync passes made while waiting for a remote change to become visible.
    pub consistency_attempts: u32,
    /// Milliseconds between those passes.
    pub consistency_interval_ms: u64,
}

/// Remote-call retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per remote call, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles on each further attempt.
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
}

/// Chunked transfer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Size of each upload chunk (in MiB).
    pub chunk_size_mb: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `pretty` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/cloudmirror/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("cloudmirror")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("cloudmirror")
                .join("snapshot.json"),
            consistency_attempts: 60,
            consistency_interval_ms: 500,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { chunk_size_mb: 64 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn consistency_interval(&self) -> Duration {
        Duration::from_millis(self.consistency_interval_ms)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl TransferConfig {
    /// Chunk size in bytes.
    pub fn chunk_size_bytes(&self) -> usize {
        usize::try_from(self.chunk_size_mb.saturating_mul(MIB)).unwrap_or(usize::MAX)
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"retry.max_attempts"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["pretty", "json"];

/// Largest accepted chunk; a chunk is held in memory while it is sent.
const MAX_CHUNK_SIZE_MB: u64 = 1024;

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if self.sync.snapshot_path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "sync.snapshot_path".into(),
                message: "must not be empty".into(),
            });
        }
        if self.sync.consistency_attempts == 0 {
            errors.push(ValidationError {
                field: "sync.consistency_attempts".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.consistency_interval_ms == 0 {
            errors.push(ValidationError {
                field: "sync.consistency_interval_ms".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- retry ---
        if self.retry.max_attempts == 0 {
            errors.push(ValidationError {
                field: "retry.max_attempts".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.retry.base_delay_ms == 0 {
            errors.push(ValidationError {
                field: "retry.base_delay_ms".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(ValidationError {
                field: "retry.max_delay_ms".into(),
                message: format!(
                    "max_delay_ms ({}) must not be below base_delay_ms ({})",
                    self.retry.max_delay_ms, self.retry.base_delay_ms
                ),
            });
        }

        // --- transfer ---
        if self.transfer.chunk_size_mb == 0 || self.transfer.chunk_size_mb > MAX_CHUNK_SIZE_MB {
            errors.push(ValidationError {
                field: "transfer.chunk_size_mb".into(),
                message: format!("must be in range 1..={MAX_CHUNK_SIZE_MB}"),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use cloudmirror_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_snapshot_path(PathBuf::from("/var/lib/cloudmirror/snapshot.json"))
///     .retry_max_attempts(5)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_snapshot_path(mut self, path: PathBuf) -> Self {
        self.config.sync.snapshot_path = path;
        self
    }

    pub fn sync_consistency_attempts(mut self, attempts: u32) -> Self {
        self.config.sync.consistency_attempts = attempts;
        self
    }

    pub fn sync_consistency_interval_ms(mut self, ms: u64) -> Self {
        self.config.sync.consistency_interval_ms = ms;
        self
    }

    // --- retry ---

    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_delay_ms = ms;
        self
    }

    // --- transfer ---

    pub fn transfer_chunk_size_mb(mut self, mb: u64) -> Self {
        self.config.transfer.chunk_size_mb = mb;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
