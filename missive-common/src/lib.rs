//! Ambient pieces shared by the missive crates: logging bootstrap, the wire
//! traffic log macros, and the configuration file model.

pub mod config;
pub mod error;
pub mod logging;

pub use tracing;

pub use error::ConfigError;
