//! Collaborator facade for metrics and structured logs.
//!
//! The gate reports through two pluggable sinks, [`MetricsSink`] and
//! [`StructuredLogger`]. Both are fallible, but a failing sink must never
//! turn an otherwise successful request into an error, so every call made
//! through [`Telemetry`] swallows the sink's error (or panic) after noting it
//! at debug level.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::logging::{LogLevel, StructuredLogger, TracingLogger};
use crate::metrics::{MetricsSink, PrometheusSink};

/// Failure reported by a metrics, logging, or trace collaborator.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("unknown trace: {0}")]
    UnknownTrace(String),

    #[error("unknown span: {0}")]
    UnknownSpan(String),

    #[error("trace already started: {0}")]
    DuplicateTrace(String),

    #[error("already finished: {0}")]
    AlreadyFinished(String),
}

/// Metric labels as (name, value) pairs.
pub type Labels = [(&'static str, String)];

/// Error-isolating handle to the metrics and logging collaborators.
///
/// Cheap to clone; all clones share the same sinks.
#[derive(Clone)]
pub struct Telemetry {
    metrics: Arc<dyn MetricsSink>,
    logger: Arc<dyn StructuredLogger>,
}

impl Telemetry {
    pub fn new(metrics: Arc<dyn MetricsSink>, logger: Arc<dyn StructuredLogger>) -> Self {
        Self { metrics, logger }
    }

    /// Increment a counter, ignoring sink failures.
    pub fn counter(&self, name: &str, delta: u64, labels: &Labels) {
        isolate("counter update", || {
            self.metrics.record_counter(name, delta, labels)
        });
    }

    /// Record a duration in milliseconds, ignoring sink failures.
    pub fn timer(&self, name: &str, millis: f64, labels: &Labels) {
        isolate("timer sample", || {
            self.metrics.record_timer(name, millis, labels)
        });
    }

    /// Emit a structured log event, ignoring sink failures.
    pub fn log(&self, level: LogLevel, message: &str, fields: &Value, category: &str) {
        isolate("structured log event", || {
            self.logger.log(level, message, fields, LOG_SOURCE, category)
        });
    }
}

/// Run one collaborator call, swallowing both its error and its panic.
///
/// Returns whether the call succeeded. Failures are noted at debug level.
pub(crate) fn isolate<F>(what: &str, call: F) -> bool
where
    F: FnOnce() -> Result<(), TelemetryError>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "Dropped {what}");
            false
        }
        Err(_) => {
            debug!("Collaborator panicked, dropped {what}");
            false
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Arc::new(PrometheusSink), Arc::new(TracingLogger))
    }
}

/// `source` attached to every event the gate logs.
pub const LOG_SOURCE: &str = "middleware";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct FailingSink {
        calls: AtomicUsize,
    }

    impl MetricsSink for FailingSink {
        fn record_counter(&self, _: &str, _: u64, _: &Labels) -> Result<(), TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TelemetryError::Unavailable("metrics backend down".into()))
        }

        fn record_timer(&self, _: &str, _: f64, _: &Labels) -> Result<(), TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TelemetryError::Unavailable("metrics backend down".into()))
        }
    }

    impl StructuredLogger for FailingSink {
        fn log(
            &self,
            _: LogLevel,
            _: &str,
            _: &Value,
            _: &str,
            _: &str,
        ) -> Result<(), TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TelemetryError::Unavailable("log shipper down".into()))
        }
    }

    #[test]
    fn test_sink_failures_are_swallowed() {
        let sink = Arc::new(FailingSink {
            calls: AtomicUsize::new(0),
        });
        let telemetry = Telemetry::new(sink.clone(), sink.clone());

        telemetry.counter("api_requests", 1, &[("status", "pending".into())]);
        telemetry.timer("api_request_duration_ms", 12.5, &[]);
        telemetry.log(LogLevel::Warn, "hello", &json!({"a": 1}), "security");

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    struct PanickingSink;

    impl MetricsSink for PanickingSink {
        fn record_counter(&self, _: &str, _: u64, _: &Labels) -> Result<(), TelemetryError> {
            panic!("counter backend bug")
        }

        fn record_timer(&self, _: &str, _: f64, _: &Labels) -> Result<(), TelemetryError> {
            panic!("timer backend bug")
        }
    }

    impl StructuredLogger for PanickingSink {
        fn log(
            &self,
            _: LogLevel,
            _: &str,
            _: &Value,
            _: &str,
            _: &str,
        ) -> Result<(), TelemetryError> {
            panic!("log shipper bug")
        }
    }

    #[test]
    fn test_sink_panics_are_swallowed() {
        let telemetry = Telemetry::new(Arc::new(PanickingSink), Arc::new(PanickingSink));

        telemetry.counter("rate_limit_exceeded", 1, &[("path", "/api/auth".into())]);
        telemetry.timer("api_request_duration_ms", 3.0, &[]);
        telemetry.log(LogLevel::Error, "Request failed", &json!({}), "error");
    }

    #[test]
    fn test_isolate_reports_outcome() {
        assert!(isolate("ok", || Ok(())));
        assert!(!isolate("err", || Err(TelemetryError::Unavailable("down".into()))));
        assert!(!isolate("panic", || panic!("bug")));
    }

    #[test]
    fn test_default_telemetry_does_not_panic() {
        let telemetry = Telemetry::default();
        telemetry.counter("api_requests", 1, &[("status", "200".into())]);
        telemetry.log(LogLevel::Info, "ok", &json!({}), "http");
    }
}
