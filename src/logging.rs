//! Structured logging: subscriber setup and the logger collaborator.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::telemetry::TelemetryError;

/// Severity accepted by [`StructuredLogger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// Logging collaborator contract: `log(level, message, fields, source, category)`.
pub trait StructuredLogger: Send + Sync {
    fn log(
        &self,
        level: LogLevel,
        message: &str,
        fields: &Value,
        source: &str,
        category: &str,
    ) -> Result<(), TelemetryError>;
}

/// [`StructuredLogger`] that forwards to `tracing` events.
///
/// `fields` is rendered as a JSON object so it survives both the pretty and
/// the JSON formatter intact.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl StructuredLogger for TracingLogger {
    fn log(
        &self,
        level: LogLevel,
        message: &str,
        fields: &Value,
        source: &str,
        category: &str,
    ) -> Result<(), TelemetryError> {
        match level {
            LogLevel::Debug => debug!(source, category, fields = %fields, "{message}"),
            LogLevel::Info => info!(source, category, fields = %fields, "{message}"),
            LogLevel::Warn => warn!(source, category, fields = %fields, "{message}"),
            LogLevel::Error => error!(source, category, fields = %fields, "{message}"),
        }
        Ok(())
    }
}

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, for local development
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_level`.
pub fn init_logging(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
    }
}
