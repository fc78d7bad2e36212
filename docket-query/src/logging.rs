//! Logging setup for docket.
//!
//! docket emits `tracing` events at session, transaction and cursor
//! lifecycle points. This module installs a subscriber for them, controlled
//! by environment variables.
//!
//! # Environment Variables
//!
//! - `DOCKET_DEBUG=true` (or `1`, `yes`) - Enable debug logging
//! - `DOCKET_LOG_LEVEL=debug|info|warn|error|trace` - Set a specific level
//! - `DOCKET_LOG_FORMAT=json|pretty|compact` - Set output format (default: json)
//!
//! Request bodies are only logged at `trace` level.
//!
//! # Usage
//!
//! ```rust,no_run
//! use docket_query::logging;
//!
//! // Initialize logging (call once at startup)
//! logging::init();
//!
//! // Or with a fixed level
//! logging::init_with_level("debug");
//! ```

use std::env;
use std::sync::Once;

static INIT: Once = Once::new();

const DEBUG_VAR: &str = "DOCKET_DEBUG";
const LEVEL_VAR: &str = "DOCKET_LOG_LEVEL";
const FORMAT_VAR: &str = "DOCKET_LOG_FORMAT";

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_level(value: Option<&str>, debug: bool) -> &'static str {
    match value.map(str::to_lowercase).as_deref() {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("info") => "info",
        Some("warn") => "warn",
        Some("error") => "error",
        _ if debug => "debug",
        _ => "warn",
    }
}

fn parse_format(value: Option<&str>) -> &'static str {
    match value.map(str::to_lowercase).as_deref() {
        Some("pretty") => "pretty",
        Some("compact") => "compact",
        _ => "json",
    }
}

/// Check if debug logging is enabled via `DOCKET_DEBUG`.
#[inline]
pub fn is_debug_enabled() -> bool {
    env::var(DEBUG_VAR).map(|v| parse_flag(&v)).unwrap_or(false)
}

/// The configured log level from `DOCKET_LOG_LEVEL`.
///
/// Defaults to "debug" if `DOCKET_DEBUG` is enabled, otherwise "warn".
pub fn get_log_level() -> &'static str {
    let level = env::var(LEVEL_VAR).ok();
    parse_level(level.as_deref(), is_debug_enabled())
}

/// The configured log format from `DOCKET_LOG_FORMAT`.
pub fn get_log_format() -> &'static str {
    let format = env::var(FORMAT_VAR).ok();
    parse_format(format.as_deref())
}

/// Initialize the docket logging system.
///
/// Does nothing unless `DOCKET_DEBUG` or `DOCKET_LOG_LEVEL` is set, or when
/// the `tracing-subscriber` feature is off. Subsequent calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        if !is_debug_enabled() && env::var(LEVEL_VAR).is_err() {
            return;
        }

        #[cfg(feature = "tracing-subscriber")]
        {
            use tracing_subscriber::{EnvFilter, fmt, prelude::*};

            let level = get_log_level();
            let filter = EnvFilter::try_new(format!(
                "docket={},docket_query={},docket_mongodb={}",
                level, level, level
            ))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

            let registry = tracing_subscriber::registry().with(filter);
            let installed = match get_log_format() {
                "json" => registry.with(fmt::layer().json()).try_init(),
                "compact" => registry.with(fmt::layer().compact()).try_init(),
                _ => registry.with(fmt::layer().pretty()).try_init(),
            };

            if installed.is_ok() {
                tracing::info!(
                    level = level,
                    format = get_log_format(),
                    "docket logging initialized"
                );
            }
        }
    });
}

/// Initialize logging with a specific level.
///
/// # Safety
///
/// This function modifies environment variables, which is unsafe in
/// multi-threaded programs. Call it at startup before spawning threads.
pub fn init_with_level(level: &str) {
    // SAFETY: only meant to be called at program startup, before threads exist.
    unsafe {
        env::set_var(LEVEL_VAR, level);
    }
    init();
}

/// Initialize debug-level logging.
///
/// # Safety
///
/// Same caveat as [`init_with_level`].
pub fn init_debug() {
    // SAFETY: only meant to be called at program startup, before threads exist.
    unsafe {
        env::set_var(DEBUG_VAR, "true");
    }
    init();
}

/// Debug logging gated on `DOCKET_DEBUG` at runtime.
#[macro_export]
macro_rules! docket_debug {
    ($($arg:tt)*) => {
        if $crate::logging::is_debug_enabled() {
            tracing::debug!($($arg)*);
        }
    };
}

/// Trace logging gated on `DOCKET_DEBUG` at runtime.
#[macro_export]
macro_rules! docket_trace {
    ($($arg:tt)*) => {
        if $crate::logging::is_debug_enabled() {
            tracing::trace!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert!(parse_flag("true"));
        assert!(parse_flag("YES"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_level_defaults() {
        assert_eq!(parse_level(None, false), "warn");
        assert_eq!(parse_level(None, true), "debug");
        assert_eq!(parse_level(Some("bogus"), false), "warn");
        assert_eq!(parse_level(Some("TRACE"), false), "trace");
    }

    #[test]
    fn test_format_defaults_to_json() {
        assert_eq!(parse_format(None), "json");
        assert_eq!(parse_format(Some("Pretty")), "pretty");
        assert_eq!(parse_format(Some("compact")), "compact");
        assert_eq!(parse_format(Some("xml")), "json");
    }
}
