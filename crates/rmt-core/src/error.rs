//! Error types shared by the migration tool
//!
//! Module-specific errors (snapshot reading, payload encoding, destination
//! I/O) live next to the code that raises them. This module holds the ones
//! every layer needs.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading or validation error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        /// Path that was attempted
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Config file is not valid TOML or has wrongly typed fields
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range or otherwise unusable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    #[cold]
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }
}

/// Result type alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_display() {
        let err = ConfigError::invalid("threads cannot be 0");
        assert_eq!(err.to_string(), "Invalid configuration: threads cannot be 0");
    }

    #[test]
    fn test_read_error_mentions_path() {
        let err = ConfigError::Read {
            path: PathBuf::from("/nope/rmt.toml"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("/nope/rmt.toml"));
    }
}
