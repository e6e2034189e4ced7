//! Structured logging initialisation
//!
//! Protocol events log at debug, lifecycle transitions at info, transient
//! network failures at warn, and local failures needing operator
//! attention at error. Output is JSON by default for log shippers;
//! `pretty` and `compact` renderings exist for terminals.
//!
//! Controlled by environment variables:
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG, TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty, compact (default json)
//! - `LOG_SPANS`: include span open/close events (default false)
//! - `RUST_LOG`: overrides the filter entirely (env_logger syntax)

use std::env;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Machine-readable JSON lines
    Json,
    /// Multi-line human format with colors
    Pretty,
    /// Single-line terminal format
    Compact,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(()),
        }
    }
}

/// Resolved logging options
#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
        }
    }
}

impl LogOptions {
    /// Read options from the environment, defaulting unknown values
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var("LOG_LEVEL")
                .ok()
                .and_then(|v| Level::from_str(&v.to_uppercase()).ok())
                .unwrap_or(defaults.level),
            format: env::var("LOG_FORMAT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.format),
            include_spans: env::var("LOG_SPANS")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(defaults.include_spans),
        }
    }

    fn span_events(&self) -> fmt::format::FmtSpan {
        if self.include_spans {
            fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
        } else {
            fmt::format::FmtSpan::NONE
        }
    }
}

/// Install the global subscriber with the given options
pub fn init_logging(options: LogOptions) {
    let mut filter = EnvFilter::new(options.level.to_string())
        // Reduce noise from dependencies
        .add_directive("tungstenite=warn".parse().unwrap())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap())
        .add_directive("tokio=warn".parse().unwrap());

    // RUST_LOG wins when set
    if let Ok(rust_log) = env::var("RUST_LOG") {
        filter = EnvFilter::new(rust_log);
    }

    let registry = tracing_subscriber::registry().with(filter);
    match options.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(options.span_events()))
            .init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(options.span_events()),
            )
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(options.span_events()),
            )
            .init(),
    }
}

/// Install the global subscriber from environment variables
pub fn init_default_logging() {
    init_logging(LogOptions::from_env());
}

/// Create a configuration-apply span with contextual information
#[macro_export]
macro_rules! apply_span {
    ($($field:tt)*) => {
        tracing::info_span!("config_apply", $($field)*)
    };
}

/// Create an engine operation span
#[macro_export]
macro_rules! engine_span {
    ($($field:tt)*) => {
        tracing::info_span!("engine_operation", $($field)*)
    };
}

/// Create a transport operation span
#[macro_export]
macro_rules! transport_span {
    ($($field:tt)*) => {
        tracing::info_span!("transport_operation", $($field)*)
    };
}

/// Create a lifecycle event span
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

// Re-export macros for convenience
pub use {apply_span, engine_span, lifecycle_span, transport_span};
