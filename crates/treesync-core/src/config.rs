//! treesync configuration
//!
//! One YAML document with four optional sections. Missing keys take their
//! defaults, so an empty file is a valid configuration:
//!
//! ```yaml
//! store:
//!   database: ~/.local/share/treesync/treesync.db
//!   channel_capacity: 256
//! walker:
//!   hash_buffer_size: 2097152
//! transfer:
//!   chunk_size: 1048576
//! logging:
//!   level: info
//!   format: text
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Default walker → store channel capacity
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default hashing scratch buffer (2 MiB)
pub const DEFAULT_HASH_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Default transfer chunk size (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

const MAX_CHANNEL_CAPACITY: usize = 1 << 20;

/// Largest accepted byte buffer (64 MiB)
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub walker: WalkerConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite file holding both snapshot generations and the tracking flags
    pub database: PathBuf,
    /// Walker → store channel capacity; `0` asks for the smallest buffer
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    /// Bytes read per hashing step
    pub hash_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per streamed content chunk
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

/// Log line encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("~/.local/share"));
        Self {
            database: data_dir.join("treesync").join("treesync.db"),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl StoreConfig {
    /// Capacity the entry channel is opened with
    ///
    /// tokio's bounded channels need at least one slot.
    #[must_use]
    pub fn effective_channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            hash_buffer_size: DEFAULT_HASH_BUFFER_SIZE,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Parses the YAML file at `path`
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// [`Config::load`], or the defaults when the file is missing or broken
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::debug!(
                path = %path.display(),
                error = %format!("{e:#}"),
                "Falling back to default configuration"
            );
            Self::default()
        })
    }

    /// `$XDG_CONFIG_HOME/treesync/config.yaml` or the platform equivalent
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("~/.config"));
        config_dir.join("treesync").join("config.yaml")
    }

    /// Every problem found, in field order; empty when the config is usable
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.store.database.as_os_str().is_empty() {
            errors.push(ValidationError::new("store.database", "must not be empty"));
        }
        if self.store.channel_capacity > MAX_CHANNEL_CAPACITY {
            errors.push(ValidationError::new(
                "store.channel_capacity",
                format!("must not exceed {MAX_CHANNEL_CAPACITY}"),
            ));
        }
        check_buffer(&mut errors, "walker.hash_buffer_size", self.walker.hash_buffer_size);
        check_buffer(&mut errors, "transfer.chunk_size", self.transfer.chunk_size);
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError::new(
                "logging.level",
                format!(
                    "'{}' is not one of {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            ));
        }

        errors
    }
}

fn check_buffer(errors: &mut Vec<ValidationError>, field: &str, bytes: usize) {
    if !(1..=MAX_BUFFER_SIZE).contains(&bytes) {
        errors.push(ValidationError::new(
            field,
            format!("must be between 1 and {MAX_BUFFER_SIZE} bytes"),
        ));
    }
}

/// One rejected field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted field name, e.g. `store.channel_capacity`
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Programmatic construction on top of [`Config::default`]
///
/// ```rust,no_run
/// use treesync_core::config::{ConfigBuilder, LogFormat};
///
/// let config = ConfigBuilder::new()
///     .store_database("/var/lib/treesync/state.db")
///     .store_channel_capacity(64)
///     .logging_format(LogFormat::Json)
///     .build_validated();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store.database = path.into();
        self
    }

    pub fn store_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.store.channel_capacity = capacity;
        self
    }

    pub fn walker_hash_buffer_size(mut self, bytes: usize) -> Self {
        self.config.walker.hash_buffer_size = bytes;
        self
    }

    pub fn transfer_chunk_size(mut self, bytes: usize) -> Self {
        self.config.transfer.chunk_size = bytes;
        self
    }

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: LogFormat) -> Self {
        self.config.logging.format = format;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }

    /// Builds, returning the validation errors instead of an unusable config
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.config;
        match config.validate() {
            errors if errors.is_empty() => Ok(config),
            errors => Err(errors),
        }
    }
}
