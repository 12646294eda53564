//! Per-request traces and the gate's own span.
//!
//! One [`Trace`] is opened for every inbound request and one [`Span`] covers
//! the gate's processing stage. Handler-level spans belong to the handlers.
//! Both records start `Pending` and move to a terminal status exactly once.

pub mod orchestrator;
pub mod store;

use std::collections::BTreeMap;

use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use orchestrator::{RequestTrace, TraceOrchestrator};
pub use store::{InMemoryTraceStore, TraceStore};

/// Free-form key/value attributes. Ordered so serialized output is stable.
pub type Attributes = BTreeMap<String, String>;

/// Longest inbound correlation id accepted as a trace id.
pub const MAX_TRACE_ID_LEN: usize = 128;

/// Lifecycle status of a trace or span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Pending,
    Completed,
    Error,
}

impl TraceStatus {
    /// Terminal status for a response: 4xx and 5xx are errors.
    pub fn from_http(status: StatusCode) -> Self {
        if status.is_client_error() || status.is_server_error() {
            TraceStatus::Error
        } else {
            TraceStatus::Completed
        }
    }

    pub fn is_terminal(self) -> bool {
        self != TraceStatus::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TraceStatus::Pending => "pending",
            TraceStatus::Completed => "completed",
            TraceStatus::Error => "error",
        }
    }
}

/// End-to-end record of one request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TraceStatus,
    pub attributes: Attributes,
}

/// Named sub-interval of a trace.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub id: String,
    pub trace_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: TraceStatus,
    pub attributes: Attributes,
}

/// Whether an externally supplied id is safe to adopt as a trace id.
///
/// Accepts 1 to [`MAX_TRACE_ID_LEN`] characters from `[A-Za-z0-9._:-]`, which
/// covers UUIDs, ULIDs and the common vendor request-id formats while keeping
/// header injection and log forging out.
pub fn is_valid_trace_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_TRACE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}
