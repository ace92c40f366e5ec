//! Error types for the missive-common crate.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that can occur while locating or loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML for the expected shape.
    #[error("Failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// An explicitly named configuration file does not exist.
    #[error("{origin} points to non-existent file: {path}")]
    NotFound { origin: &'static str, path: PathBuf },

    /// None of the default locations held a configuration file.
    #[error("No configuration file found. Tried:\n{tried}")]
    NoneFound { tried: String },

    /// A configuration value is invalid.
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Specialized `Result` type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
