//! Configuration file model.
//!
//! ```toml
//! [smtp]
//! host = "mail.example.com"
//! port = 587
//! security = "opportunistic"
//! username = "enquiries"
//! password = "hunter2"
//!
//! [message]
//! from = "noreply@example.com"
//! to = ["sales@example.com"]
//! ```
//!
//! - [`security`]: the STARTTLS / implicit TLS policy

pub mod security;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

pub use security::SecurityMode;

use crate::error::{ConfigError, ConfigResult};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "MISSIVE_CONFIG";

/// Locations searched, in order, when nothing names a file explicitly.
pub const DEFAULT_PATHS: [&str; 2] = ["./missive.toml", "/etc/missive/missive.toml"];

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub message: MessageDefaults,
}

/// Where and how to submit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpConfig {
    pub host: String,

    /// Defaults to the conventional port for `security`.
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub security: SecurityMode,

    /// Argument to EHLO.
    #[serde(default = "defaults::helo_name")]
    pub helo_name: String,

    /// Window allowed for each reply (and for connecting).
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// **SECURITY WARNING**: disables certificate verification.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Envelope defaults; the command line may add recipients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageDefaults {
    pub from: String,

    #[serde(default)]
    pub reply_to: Option<String>,

    #[serde(default)]
    pub to: Vec<String>,
}

impl SmtpConfig {
    /// The configured port, or the mode's conventional one.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.security.default_port())
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Username and password, only when both are present and non-empty.
    #[must_use]
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .zip(self.password.as_deref())
            .filter(|(username, password)| !username.is_empty() && !password.is_empty())
    }
}

impl Config {
    /// Parses and validates configuration text. `origin` only labels errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for [`Config`] or a
    /// value is out of range.
    pub fn parse(text: &str, origin: &Path) -> ConfigResult<Self> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.smtp.host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "smtp.host",
                reason: "must not be empty".to_string(),
            });
        }
        if self.smtp.port == Some(0) {
            return Err(ConfigError::Invalid {
                field: "smtp.port",
                reason: "must not be zero".to_string(),
            });
        }
        if self.smtp.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "smtp.timeout_secs",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.message.from.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "message.from",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Finds the configuration file using the following precedence:
/// 1. `explicit` (e.g. a `--config` argument)
/// 2. `MISSIVE_CONFIG` (passed in as `from_env`)
/// 3. the entries of [`DEFAULT_PATHS`]
///
/// # Errors
///
/// Returns an error if an explicit or environment path does not exist, or if
/// none of the defaults exist.
pub fn locate(explicit: Option<&Path>, from_env: Option<&Path>) -> ConfigResult<PathBuf> {
    for (origin, candidate) in [("--config", explicit), (CONFIG_ENV_VAR, from_env)] {
        if let Some(path) = candidate {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(ConfigError::NotFound {
                origin,
                path: path.to_path_buf(),
            });
        }
    }

    DEFAULT_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .ok_or_else(|| ConfigError::NoneFound {
            tried: std::iter::once(format!("  - {CONFIG_ENV_VAR} environment variable"))
                .chain(DEFAULT_PATHS.iter().map(|p| format!("  - {p}")))
                .collect::<Vec<_>>()
                .join("\n"),
        })
}

mod defaults {
    pub fn helo_name() -> String {
        "localhost".to_string()
    }

    pub const fn timeout_secs() -> u64 {
        30
    }
}
