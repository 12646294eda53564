//! Trace store collaborator and its in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::{Attributes, Span, Trace, TraceStatus};
use crate::telemetry::TelemetryError;

/// Trace store collaborator contract.
///
/// Implementations must not block and must refuse to change a record whose
/// status is already terminal.
pub trait TraceStore: Send + Sync {
    fn start_trace(&self, trace: Trace) -> Result<(), TelemetryError>;

    fn start_span(&self, span: Span) -> Result<(), TelemetryError>;

    fn finish_span(
        &self,
        span_id: &str,
        status: TraceStatus,
        attributes: Attributes,
        finished_at: DateTime<Utc>,
    ) -> Result<(), TelemetryError>;

    fn finish_trace(
        &self,
        trace_id: &str,
        status: TraceStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), TelemetryError>;
}

#[derive(Default)]
struct StoreInner {
    traces: HashMap<String, Trace>,
    spans: HashMap<String, Span>,
    /// Span ids per trace, for eviction
    trace_spans: HashMap<String, Vec<String>>,
    /// Trace ids in start order, oldest first
    order: VecDeque<String>,
}

impl StoreInner {
    fn evict_oldest(&mut self) {
        if let Some(trace_id) = self.order.pop_front() {
            self.traces.remove(&trace_id);
            for span_id in self.trace_spans.remove(&trace_id).unwrap_or_default() {
                self.spans.remove(&span_id);
            }
        }
    }
}

/// Bounded in-process trace store.
///
/// Keeps the most recent `capacity` traces (with their spans); older ones are
/// evicted in start order.
pub struct InMemoryTraceStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl InMemoryTraceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Snapshot of a trace.
    pub fn trace(&self, trace_id: &str) -> Option<Trace> {
        self.lock().traces.get(trace_id).cloned()
    }

    /// Snapshot of every span recorded for a trace, in start order.
    pub fn spans(&self, trace_id: &str) -> Vec<Span> {
        let inner = self.lock();
        inner
            .trace_spans
            .get(trace_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.spans.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of retained traces.
    pub fn len(&self) -> usize {
        self.lock().traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TraceStore for InMemoryTraceStore {
    fn start_trace(&self, trace: Trace) -> Result<(), TelemetryError> {
        let mut inner = self.lock();
        if inner.traces.contains_key(&trace.id) {
            return Err(TelemetryError::DuplicateTrace(trace.id));
        }

        inner.order.push_back(trace.id.clone());
        inner.trace_spans.insert(trace.id.clone(), Vec::new());
        inner.traces.insert(trace.id.clone(), trace);

        while inner.traces.len() > self.capacity {
            inner.evict_oldest();
        }
        Ok(())
    }

    fn start_span(&self, span: Span) -> Result<(), TelemetryError> {
        let mut inner = self.lock();
        let Some(span_ids) = inner.trace_spans.get_mut(&span.trace_id) else {
            return Err(TelemetryError::UnknownTrace(span.trace_id));
        };
        span_ids.push(span.id.clone());
        inner.spans.insert(span.id.clone(), span);
        Ok(())
    }

    fn finish_span(
        &self,
        span_id: &str,
        status: TraceStatus,
        attributes: Attributes,
        finished_at: DateTime<Utc>,
    ) -> Result<(), TelemetryError> {
        let mut inner = self.lock();
        let span = inner
            .spans
            .get_mut(span_id)
            .ok_or_else(|| TelemetryError::UnknownSpan(span_id.to_string()))?;
        if span.status.is_terminal() {
            return Err(TelemetryError::AlreadyFinished(span_id.to_string()));
        }

        span.status = status;
        span.finished_at = Some(finished_at);
        span.attributes.extend(attributes);
        Ok(())
    }

    fn finish_trace(
        &self,
        trace_id: &str,
        status: TraceStatus,
        finished_at: DateTime<Utc>,
    ) -> Result<(), TelemetryError> {
        let mut inner = self.lock();
        let trace = inner
            .traces
            .get_mut(trace_id)
            .ok_or_else(|| TelemetryError::UnknownTrace(trace_id.to_string()))?;
        if trace.status.is_terminal() {
            return Err(TelemetryError::AlreadyFinished(trace_id.to_string()));
        }

        trace.status = status;
        trace.finished_at = Some(finished_at);
        Ok(())
    }
}
