//! Configuration module for ferrite-rmt
//!
//! Loads the migration settings from a TOML file. Every section and field
//! is optional and falls back to the defaults below; CLI flags are applied
//! on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Oldest snapshot format version accepted as a target
pub const MIN_RDB_VERSION: u16 = 1;

/// Newest snapshot format version understood by the reader
pub const MAX_RDB_VERSION: u16 = 12;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool and delivery settings
    pub migrate: MigrateConfig,

    /// Payload generation settings
    pub dump: DumpConfig,

    /// Entry selection
    pub filter: FilterConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.migrate.validate()?;
        self.dump.validate()?;
        self.filter.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Worker pool and delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Number of workers, each with its own destination connection
    pub threads: usize,

    /// Extra attempts after the first one fails
    pub retries: u32,

    /// Pending commands that trigger an automatic pipeline flush
    pub batch_size: usize,

    /// Wait for every command's acknowledgement before the next one.
    /// Retry with reconnection only happens in this mode.
    pub flush: bool,

    /// Events buffered per worker before the reader blocks
    pub queue_capacity: usize,

    /// Connect and reply timeout in milliseconds
    pub timeout_ms: u64,

    /// Overwrite keys that already exist on the destination
    pub replace: bool,

    /// Destination predates `RESTORE ... REPLACE`
    pub legacy: bool,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            retries: 1,
            batch_size: 4096,
            flush: true,
            queue_capacity: 1024,
            timeout_ms: 30_000,
            replace: false,
            legacy: false,
        }
    }
}

impl MigrateConfig {
    /// Total attempts per key, including the first one
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Connect and reply timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(ConfigError::invalid("migrate.threads cannot be 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("migrate.batch_size cannot be 0"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("migrate.queue_capacity cannot be 0"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("migrate.timeout_ms cannot be 0"));
        }
        if !self.flush && self.retries > 0 {
            tracing::warn!(
                retries = self.retries,
                "migrate.flush is disabled, failed writes will not be retried"
            );
        }
        Ok(())
    }
}

/// Payload generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Target payload format version (None = the snapshot's own version)
    pub rdb_version: Option<u16>,

    /// Read buffer size for the snapshot file
    pub buffer_size: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            rdb_version: None,
            buffer_size: 8192,
        }
    }
}

impl DumpConfig {
    fn validate(&self) -> Result<()> {
        if let Some(version) = self.rdb_version {
            if !(MIN_RDB_VERSION..=MAX_RDB_VERSION).contains(&version) {
                return Err(ConfigError::invalid(format!(
                    "dump.rdb_version must be between {} and {}, got {}",
                    MIN_RDB_VERSION, MAX_RDB_VERSION, version
                )));
            }
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid("dump.buffer_size cannot be 0"));
        }
        Ok(())
    }
}

/// Entry selection. An empty list matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Logical databases to migrate
    pub db: Vec<u32>,

    /// Key patterns (regular expressions, any match selects the key)
    pub keys: Vec<String>,

    /// Value kinds to migrate
    pub types: Vec<ValueKind>,
}

impl FilterConfig {
    /// Whether any selection criterion is set
    pub fn is_empty(&self) -> bool {
        self.db.is_empty() && self.keys.is_empty() && self.types.is_empty()
    }

    fn validate(&self) -> Result<()> {
        for pattern in &self.keys {
            regex::bytes::Regex::new(pattern).map_err(|e| {
                ConfigError::invalid(format!("filter.keys: invalid pattern {:?}: {}", pattern, e))
            })?;
        }
        Ok(())
    }
}

/// Logical value kind, independent of its on-disk encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Plain string
    String,
    /// List
    List,
    /// Set
    Set,
    /// Sorted set
    Zset,
    /// Hash
    Hash,
    /// Module value
    Module,
    /// Stream
    Stream,
}

impl ValueKind {
    /// Lowercase name as used in config files and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::Zset => "zset",
            ValueKind::Hash => "hash",
            ValueKind::Module => "module",
            ValueKind::Stream => "stream",
        }
    }
}

impl std::str::FromStr for ValueKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" => Ok(ValueKind::String),
            "list" => Ok(ValueKind::List),
            "set" => Ok(ValueKind::Set),
            "zset" => Ok(ValueKind::Zset),
            "hash" => Ok(ValueKind::Hash),
            "module" => Ok(ValueKind::Module),
            "stream" => Ok(ValueKind::Stream),
            other => Err(ConfigError::invalid(format!("unknown value type: {}", other))),
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        match self.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(ConfigError::invalid(format!(
                "logging.level must be one of trace, debug, info, warn or error, got {:?}",
                other
            ))),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}
