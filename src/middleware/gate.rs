//! The admission gate: the outermost layer every request passes through.
//!
//! # Request Lifecycle
//!
//! ```text
//! Request
//!    │
//!    ▼
//! open trace + gate span ──► X-Trace-Id on request, TraceContext extension
//!    │
//!    ▼
//! admit(client, path) ──────► 429 (Rejected)
//!    │
//!    ▼
//! api_requests{status="pending"}
//!    │
//!    ▼
//! handler ──────────────────► error or panic → 500 {error, traceId}
//!    │
//!    ▼
//! security headers, X-RateLimit-*, X-Trace-Id
//! api_requests{status}, api_request_duration_ms
//! finish span + trace
//! ```
//!
//! Every stage reports failure as a [`GateError`] value; the single adapter
//! in [`GateService::call`] turns it into the response. Panics in the
//! request setup and in the handler are caught with `catch_unwind` (a panic
//! before the trace exists is answered under a fresh trace id), and if the
//! request future is dropped mid-flight the
//! [`RequestTrace`](crate::trace::RequestTrace) guard still closes the trace.
//!
//! The layer's error type is `Infallible`: downstream service errors become
//! 500 responses here, so it can wrap any axum `Router`.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::http::header::USER_AGENT;
use axum::http::{HeaderValue, Request, Response};
use futures_util::FutureExt;
use serde_json::json;
use tower::{Layer, Service, ServiceExt};
use tracing::{Instrument, debug_span};
use uuid::Uuid;

use super::correlation::{
    TRACE_ID_HEADER, TraceContext, inbound_correlation_id, inbound_parent_span_id,
};
use super::ip::{TrustedProxyConfig, UNKNOWN_IP, extract_client_ip};
use crate::admission::AdmissionController;
use crate::error::GateError;
use crate::logging::LogLevel;
use crate::metrics::names;
use crate::security_headers::SecurityHeaders;
use crate::telemetry::Telemetry;
use crate::trace::{Attributes, RequestTrace, TraceOrchestrator, TraceStatus};

/// Log category for fail-safe errors.
const ERROR_CATEGORY: &str = "error";

/// Shared collaborators of the gate.
struct GateInner {
    admission: AdmissionController,
    orchestrator: TraceOrchestrator,
    telemetry: Telemetry,
    security_headers: SecurityHeaders,
    trusted_proxies: TrustedProxyConfig,
}

/// Admission gate layer for the Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/api/recipes", get(handler))
///     .layer(state.gate_layer());
/// ```
#[derive(Clone)]
pub struct GateLayer {
    inner: Arc<GateInner>,
}

impl GateLayer {
    pub fn new(
        admission: AdmissionController,
        orchestrator: TraceOrchestrator,
        telemetry: Telemetry,
        security_headers: SecurityHeaders,
        trusted_proxies: TrustedProxyConfig,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                admission,
                orchestrator,
                telemetry,
                security_headers,
                trusted_proxies,
            }),
        }
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GateService {
            inner,
            gate: self.inner.clone(),
        }
    }
}

/// Admission gate service wrapper.
#[derive(Clone)]
pub struct GateService<S> {
    inner: S,
    gate: Arc<GateInner>,
}

/// Per-request facts captured before the request is moved downstream.
struct RequestInfo {
    method: String,
    path: String,
    client_id: String,
    user_agent: String,
}

impl<S> Service<Request<Body>> for GateService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: fmt::Display,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness of the inner service is awaited per request (`oneshot`),
        // where its failure can still be answered with a 500
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let inner = self.inner.clone();
        let started = Instant::now();

        Box::pin(async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();

            // Setup runs under the same guard as the handler
            let opened = panic::catch_unwind(AssertUnwindSafe(|| gate.open(req)));
            let (req, info, trace) = match opened {
                Ok(opened) => opened,
                Err(payload) => {
                    let info = RequestInfo {
                        method,
                        path,
                        client_id: UNKNOWN_IP.to_string(),
                        user_agent: String::new(),
                    };
                    let trace_id = Uuid::new_v4().to_string();
                    let err = GateError::Panicked(panic_message(&*payload));
                    let response = gate.fail(err, &trace_id, &info);
                    return Ok(gate.finalize(response, &trace_id, &info, started));
                }
            };
            let trace_id = trace.trace_id().to_string();
            let span = debug_span!("gate", trace_id = %trace_id);

            async move {
                let outcome = AssertUnwindSafe(gate.admit_and_forward(inner, req, &info))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(GateError::Panicked(panic_message(&*payload))));

                let response = match outcome {
                    Ok(response) => response,
                    Err(err) => gate.fail(err, &trace_id, &info),
                };
                let response = gate.finalize(response, &trace_id, &info, started);

                let mut finish_attributes = Attributes::new();
                finish_attributes.insert(
                    "statusCode".to_string(),
                    response.status().as_u16().to_string(),
                );
                finish_attributes.insert(
                    "durationMs".to_string(),
                    format!("{:.3}", started.elapsed().as_secs_f64() * 1000.0),
                );
                trace.finish(TraceStatus::from_http(response.status()), finish_attributes);

                Ok::<_, Infallible>(response)
            }
            .instrument(span)
            .await
        })
    }
}

impl GateInner {
    /// Open the trace and tag the request with it.
    fn open(&self, mut req: Request<Body>) -> (Request<Body>, RequestInfo, RequestTrace) {
        let info = RequestInfo {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            client_id: extract_client_ip(&req, &self.trusted_proxies).into_owned(),
            user_agent: req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        };

        let mut attributes = Attributes::new();
        attributes.insert("method".to_string(), info.method.clone());
        attributes.insert("path".to_string(), info.path.clone());
        attributes.insert("clientId".to_string(), info.client_id.clone());
        attributes.insert("userAgent".to_string(), info.user_agent.clone());

        let trace = self.orchestrator.begin(
            &format!("{} {}", info.method, info.path),
            inbound_parent_span_id(&req),
            inbound_correlation_id(&req),
            attributes,
        );

        // Always valid: trace ids are either checked inbound ids or UUIDs
        if let Ok(value) = HeaderValue::from_str(trace.trace_id()) {
            req.headers_mut().insert(TRACE_ID_HEADER, value);
        }
        req.extensions_mut().insert(TraceContext {
            trace_id: trace.trace_id().to_string(),
            span_id: trace.span_id().to_string(),
        });

        (req, info, trace)
    }

    /// Response headers and request metrics, applied to every response.
    fn finalize(
        &self,
        mut response: Response<Body>,
        trace_id: &str,
        info: &RequestInfo,
        started: Instant,
    ) -> Response<Body> {
        let headers = response.headers_mut();
        self.security_headers.apply(headers);
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            headers.insert(TRACE_ID_HEADER, value);
        }

        let labels = [
            ("method", info.method.clone()),
            ("path", info.path.clone()),
            ("status", response.status().as_u16().to_string()),
        ];
        self.telemetry.counter(names::API_REQUESTS, 1, &labels);
        self.telemetry.timer(
            names::API_REQUEST_DURATION_MS,
            started.elapsed().as_secs_f64() * 1000.0,
            &labels,
        );
        response
    }

    /// Admission, then the downstream handler.
    async fn admit_and_forward<S>(
        &self,
        inner: S,
        req: Request<Body>,
        info: &RequestInfo,
    ) -> Result<Response<Body>, GateError>
    where
        S: Service<Request<Body>, Response = Response<Body>>,
        S::Error: fmt::Display,
    {
        let rate_limit = self
            .admission
            .admit(&info.client_id, &info.path, &info.user_agent)?
            .into_result()?;

        self.telemetry.counter(
            names::API_REQUESTS,
            1,
            &[
                ("method", info.method.clone()),
                ("path", info.path.clone()),
                ("status", "pending".to_string()),
            ],
        );

        let mut response = inner
            .oneshot(req)
            .await
            .map_err(|e| GateError::Downstream(e.to_string()))?;

        if let Some(headers) = rate_limit {
            headers.apply(response.headers_mut());
        }
        Ok(response)
    }

    /// Report a failure and build its response.
    ///
    /// Rejections were already counted and logged by the admission controller.
    fn fail(&self, err: GateError, trace_id: &str, info: &RequestInfo) -> Response<Body> {
        if !err.is_rejection() {
            self.telemetry.counter(
                names::API_ERRORS,
                1,
                &[
                    ("method", info.method.clone()),
                    ("path", info.path.clone()),
                    ("kind", err.kind().to_string()),
                ],
            );
            self.telemetry.log(
                LogLevel::Error,
                "Request failed",
                &json!({
                    "traceId": trace_id,
                    "kind": err.kind(),
                    "error": err.to_string(),
                    "method": info.method,
                    "path": info.path,
                    "clientId": info.client_id,
                }),
                ERROR_CATEGORY,
            );
        }
        err.into_response(trace_id)
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
