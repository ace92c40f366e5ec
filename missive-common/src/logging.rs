//! Logging bootstrap and the wire-traffic macros.
//!
//! Library code only ever emits `tracing` events; nothing is printed unless
//! the embedding program calls [`init`] (or installs its own subscriber).

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError,
};

/// Environment variable consulted for the log level.
pub const LOG_LEVEL_VAR: &str = "LOG_LEVEL";

/// Emits `$($msg),*` at `$level` inside a span named `$direction`.
#[macro_export]
macro_rules! traffic {
    ($level:expr, $direction:literal, $($msg:tt)+) => {{
        let span = $crate::tracing::span!($level, $direction);
        let _entered = span.enter();

        $crate::tracing::event!($level, $($msg)+)
    }};
}

/// Bytes written to the server.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::traffic!($crate::tracing::Level::$level, "outgoing", $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::outgoing!(level = TRACE, $($msg)+)
    };
}

/// Replies read from the server.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::traffic!($crate::tracing::Level::$level, "incoming", $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::incoming!(level = TRACE, $($msg)+)
    };
}

/// Client-side state changes that never touch the wire.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)+) => {
        $crate::traffic!($crate::tracing::Level::$level, "internal", $($msg)+)
    };

    ($($msg:tt)+) => {
        $crate::internal!(level = TRACE, $($msg)+)
    };
}

/// The level used when `LOG_LEVEL` is unset.
const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

/// Resolves the configured level, falling back to the build default when the
/// value is missing or unparseable.
pub fn resolve_level(configured: Option<&str>) -> LevelFilter {
    let default = default_level();

    configured.map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Installs a compact fmt subscriber showing only `missive*` targets.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been installed.
pub fn init() -> Result<(), TryInitError> {
    let configured = std::env::var(LOG_LEVEL_VAR).ok();
    let level = resolve_level(configured.as_deref());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("missive")
                })),
        )
        .try_init()
}
