//! Prometheus metrics for the admission gate.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `rate_limit_exceeded` - Rejected requests (labels: path, client, user_agent)
//! - `api_requests` - Requests seen by the gate (labels: method, path, status;
//!   `status="pending"` when admitted, the HTTP status once answered)
//! - `api_errors` - Requests that ended in the fail-safe 500 (labels: method, path, kind)
//!
//! ## Histograms
//! - `api_request_duration_ms` - Gate-to-response latency in milliseconds
//!   (labels: method, path, status)
//!
//! ## Gauges
//! - `rate_limit_active_windows` - Live counters in the window store after the
//!   last background sweep
//!
//! # Usage
//!
//! ```rust,ignore
//! use mealplan_gate::metrics::try_init_metrics;
//!
//! // Initialize the exporter (call once at startup)
//! try_init_metrics("0.0.0.0:9090".parse()?);
//! ```
//!
//! Without an installed exporter the `metrics` facade is a no-op, so
//! [`PrometheusSink`] is safe to use in tests.

use std::net::SocketAddr;

use metrics::{Label, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

use crate::telemetry::{Labels, TelemetryError};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const API_REQUESTS: &str = "api_requests";
    pub const API_ERRORS: &str = "api_errors";
    pub const API_REQUEST_DURATION_MS: &str = "api_request_duration_ms";
    pub const RATE_LIMIT_ACTIVE_WINDOWS: &str = "rate_limit_active_windows";
}

/// Metrics collaborator contract.
///
/// Implementations must not block: they are called inline on the request
/// path.
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, name: &str, delta: u64, labels: &Labels)
    -> Result<(), TelemetryError>;

    fn record_timer(&self, name: &str, millis: f64, labels: &Labels)
    -> Result<(), TelemetryError>;
}

/// [`MetricsSink`] backed by the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

fn to_labels(labels: &Labels) -> Vec<Label> {
    labels
        .iter()
        .map(|(key, value)| Label::new(*key, value.clone()))
        .collect()
}

impl MetricsSink for PrometheusSink {
    fn record_counter(
        &self,
        name: &str,
        delta: u64,
        labels: &Labels,
    ) -> Result<(), TelemetryError> {
        counter!(name.to_owned(), to_labels(labels)).increment(delta);
        Ok(())
    }

    fn record_timer(&self, name: &str, millis: f64, labels: &Labels) -> Result<(), TelemetryError> {
        histogram!(name.to_owned(), to_labels(labels)).record(millis);
        Ok(())
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// This sets up metric descriptions and starts the Prometheus HTTP listener
/// on the specified address.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMIT_EXCEEDED,
        "Requests rejected by the admission gate"
    );
    describe_counter!(names::API_REQUESTS, "Requests seen by the admission gate");
    describe_counter!(
        names::API_ERRORS,
        "Requests answered with the fail-safe 500 response"
    );
    describe_histogram!(
        names::API_REQUEST_DURATION_MS,
        "Request duration in milliseconds, measured at the gate"
    );
    describe_gauge!(
        names::RATE_LIMIT_ACTIVE_WINDOWS,
        "Live rate limit counters after the last sweep"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

/// Update the active window gauge.
pub fn set_active_windows(count: usize) {
    // Precision loss above 2^53 windows is irrelevant here
    #[allow(clippy::cast_precision_loss)]
    gauge!(names::RATE_LIMIT_ACTIVE_WINDOWS).set(count as f64);
}
