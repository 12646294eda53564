//! Starts and finishes the per-request trace and the gate span.
//!
//! # Finish-Once Guarantee
//!
//! [`TraceOrchestrator::begin`] returns a [`RequestTrace`] guard. Calling
//! [`RequestTrace::finish`] consumes it and closes the span, then the trace.
//! If the guard is dropped unfinished (the request future was cancelled, or
//! a panic unwound past it) the drop handler closes both with
//! [`TraceStatus::Error`] and `aborted=true`. Either way each record is
//! finished exactly once.
//!
//! ```rust,ignore
//! let trace = orchestrator.begin("GET /api/recipes", None, None, Attributes::new());
//! let response = handle().await;
//! trace.finish(TraceStatus::from_http(response.status()), Attributes::new());
//! ```
//!
//! Trace store errors and panics are logged at debug level and otherwise
//! ignored.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::{Attributes, InMemoryTraceStore, Span, Trace, TraceStatus, TraceStore, is_valid_trace_id};
use crate::telemetry::{TelemetryError, isolate};

/// Name of the span covering the gate's own processing.
pub const GATE_SPAN_NAME: &str = "middleware";

/// Attribute holding an inbound correlation id that could not be the trace id.
pub const CORRELATION_ATTRIBUTE: &str = "correlationId";

fn new_trace(id: &str, name: &str, parent_id: Option<String>, attributes: Attributes) -> Trace {
    Trace {
        id: id.to_string(),
        name: name.to_string(),
        parent_id,
        started_at: Utc::now(),
        finished_at: None,
        status: TraceStatus::Pending,
        attributes,
    }
}

/// Front end to the trace store collaborator. Cheap to clone.
#[derive(Clone)]
pub struct TraceOrchestrator {
    store: Arc<dyn TraceStore>,
}

impl TraceOrchestrator {
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        Self { store }
    }

    /// Open the trace for a request and return its id.
    ///
    /// A valid `correlation_id` is adopted as the trace id so an upstream
    /// caller's trace continues here; otherwise a UUIDv4 is generated. If the
    /// adopted id is already traced (a retry, or a session-wide correlation
    /// id) the request gets a fresh UUIDv4 and the inbound id is kept in the
    /// `correlationId` attribute. The id is returned even if the store
    /// refuses the record.
    pub fn start_request(
        &self,
        name: &str,
        parent_id: Option<&str>,
        correlation_id: Option<&str>,
        attributes: Attributes,
    ) -> String {
        let parent_id = parent_id
            .filter(|id| is_valid_trace_id(id))
            .map(str::to_string);

        let Some(adopted) = correlation_id.filter(|id| is_valid_trace_id(id)) else {
            let trace_id = Uuid::new_v4().to_string();
            self.store_trace(new_trace(&trace_id, name, parent_id, attributes));
            return trace_id;
        };

        let trace = new_trace(adopted, name, parent_id.clone(), attributes.clone());
        let started = panic::catch_unwind(AssertUnwindSafe(|| self.store.start_trace(trace)))
            .unwrap_or_else(|_| Err(TelemetryError::Unavailable("trace store panicked".into())));
        match started {
            Ok(()) => adopted.to_string(),
            Err(TelemetryError::DuplicateTrace(_)) => {
                let trace_id = Uuid::new_v4().to_string();
                debug!(
                    correlation_id = adopted,
                    trace_id = %trace_id,
                    "Correlation id already traced, starting a fresh trace"
                );
                let mut attributes = attributes;
                attributes.insert(CORRELATION_ATTRIBUTE.to_string(), adopted.to_string());
                self.store_trace(new_trace(&trace_id, name, parent_id, attributes));
                trace_id
            }
            Err(e) => {
                debug!(trace_id = adopted, error = %e, "Trace store rejected start_trace");
                adopted.to_string()
            }
        }
    }

    fn store_trace(&self, trace: Trace) {
        isolate("start_trace", || self.store.start_trace(trace));
    }

    /// Open a span within `trace_id` and return its id.
    pub fn start_span(&self, trace_id: &str, name: &str) -> String {
        let span_id = Uuid::new_v4().to_string();
        let span = Span {
            id: span_id.clone(),
            trace_id: trace_id.to_string(),
            name: name.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: TraceStatus::Pending,
            attributes: Attributes::new(),
        };

        isolate("start_span", || self.store.start_span(span));
        span_id
    }

    pub fn finish_span(&self, span_id: &str, status: TraceStatus, attributes: Attributes) {
        isolate("finish_span", || {
            self.store
                .finish_span(span_id, status, attributes, Utc::now())
        });
    }

    pub fn finish_trace(&self, trace_id: &str, status: TraceStatus) {
        isolate("finish_trace", || {
            self.store.finish_trace(trace_id, status, Utc::now())
        });
    }

    /// Open the trace and the gate span, returning the finish-once guard.
    pub fn begin(
        &self,
        name: &str,
        parent_id: Option<&str>,
        correlation_id: Option<&str>,
        attributes: Attributes,
    ) -> RequestTrace {
        let trace_id = self.start_request(name, parent_id, correlation_id, attributes);
        let span_id = self.start_span(&trace_id, GATE_SPAN_NAME);
        RequestTrace {
            trace_id,
            span_id,
            orchestrator: self.clone(),
            finished: false,
        }
    }
}

impl Default for TraceOrchestrator {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryTraceStore::new(10_000)))
    }
}

/// Open trace + gate span for one request. Finishes both exactly once.
pub struct RequestTrace {
    trace_id: String,
    span_id: String,
    orchestrator: TraceOrchestrator,
    finished: bool,
}

impl RequestTrace {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Finish the span, then the trace, with `status`.
    pub fn finish(mut self, status: TraceStatus, attributes: Attributes) {
        self.close(status, attributes);
    }

    fn close(&mut self, status: TraceStatus, attributes: Attributes) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.orchestrator
            .finish_span(&self.span_id, status, attributes);
        self.orchestrator.finish_trace(&self.trace_id, status);
    }
}

impl Drop for RequestTrace {
    fn drop(&mut self) {
        if !self.finished {
            debug!(trace_id = %self.trace_id, "Request ended before the gate finished its trace");
            let mut attributes = Attributes::new();
            attributes.insert("aborted".to_string(), "true".to_string());
            self.close(TraceStatus::Error, attributes);
        }
    }
}
