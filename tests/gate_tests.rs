//! End-to-end tests of the gate through the full router, driven with
//! `tower::ServiceExt::oneshot` (no sockets).
//!
//! Collaborators are replaced with recorders so the metrics, logs and traces
//! produced by each request can be asserted on.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::extract::Extension;
use axum::http::{Request, Response, StatusCode};
use axum::routing::{get, post};
use serde_json::Value;
use tokio::task::JoinSet;
use chrono::{DateTime, Utc};
use tower::{Layer, ServiceExt, service_fn};

use mealplan_gate::logging::{LogLevel, StructuredLogger};
use mealplan_gate::metrics::{MetricsSink, names};
use mealplan_gate::policy::RateLimitPolicy;
use mealplan_gate::telemetry::Labels;
use mealplan_gate::trace::{Attributes, InMemoryTraceStore, Span, Trace, TraceStore};
use mealplan_gate::window_store::{StoreError, WindowDecision, WindowKey, WindowStore};
use mealplan_gate::{Config, Environment, GateState, TelemetryError, TraceContext, TraceStatus};

// ============================================================================
// Fixture
// ============================================================================

#[derive(Default)]
struct Recorder {
    counters: Mutex<Vec<(String, Vec<(String, String)>)>>,
    logs: Mutex<Vec<(LogLevel, String, String)>>,
}

impl Recorder {
    fn count(&self, name: &str) -> usize {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .count()
    }

    fn logged(&self, level: LogLevel, category: &str) -> usize {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _, c)| *l == level && c == category)
            .count()
    }
}

impl MetricsSink for Recorder {
    fn record_counter(&self, name: &str, _: u64, labels: &Labels) -> Result<(), TelemetryError> {
        let labels = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        self.counters.lock().unwrap().push((name.to_string(), labels));
        Ok(())
    }

    fn record_timer(&self, _: &str, _: f64, _: &Labels) -> Result<(), TelemetryError> {
        Ok(())
    }
}

impl StructuredLogger for Recorder {
    fn log(
        &self,
        level: LogLevel,
        message: &str,
        _: &Value,
        _: &str,
        category: &str,
    ) -> Result<(), TelemetryError> {
        self.logs
            .lock()
            .unwrap()
            .push((level, message.to_string(), category.to_string()));
        Ok(())
    }
}

/// Collaborator that fails every call.
struct Broken;

impl MetricsSink for Broken {
    fn record_counter(&self, _: &str, _: u64, _: &Labels) -> Result<(), TelemetryError> {
        Err(TelemetryError::Unavailable("metrics down".into()))
    }

    fn record_timer(&self, _: &str, _: f64, _: &Labels) -> Result<(), TelemetryError> {
        Err(TelemetryError::Unavailable("metrics down".into()))
    }
}

impl StructuredLogger for Broken {
    fn log(&self, _: LogLevel, _: &str, _: &Value, _: &str, _: &str) -> Result<(), TelemetryError> {
        Err(TelemetryError::Unavailable("logs down".into()))
    }
}

/// Collaborator that panics on every call.
struct Buggy;

impl MetricsSink for Buggy {
    fn record_counter(&self, _: &str, _: u64, _: &Labels) -> Result<(), TelemetryError> {
        panic!("metrics client bug")
    }

    fn record_timer(&self, _: &str, _: f64, _: &Labels) -> Result<(), TelemetryError> {
        panic!("metrics client bug")
    }
}

impl StructuredLogger for Buggy {
    fn log(&self, _: LogLevel, _: &str, _: &Value, _: &str, _: &str) -> Result<(), TelemetryError> {
        panic!("log shipper bug")
    }
}

impl TraceStore for Buggy {
    fn start_trace(&self, _: Trace) -> Result<(), TelemetryError> {
        panic!("trace store bug")
    }

    fn start_span(&self, _: Span) -> Result<(), TelemetryError> {
        panic!("trace store bug")
    }

    fn finish_span(
        &self,
        _: &str,
        _: TraceStatus,
        _: Attributes,
        _: DateTime<Utc>,
    ) -> Result<(), TelemetryError> {
        panic!("trace store bug")
    }

    fn finish_trace(&self, _: &str, _: TraceStatus, _: DateTime<Utc>) -> Result<(), TelemetryError> {
        panic!("trace store bug")
    }
}

/// Shared window store that is down.
struct UnreachableStore;

impl WindowStore for UnreachableStore {
    fn check_and_increment(
        &self,
        _: &WindowKey,
        _: &RateLimitPolicy,
        _: i64,
    ) -> Result<WindowDecision, StoreError> {
        Err(StoreError::Unavailable(
            "redis://cache:6379 auth failed (password=hunter2)".into(),
        ))
    }

    fn sweep_expired(&self, _: i64) -> usize {
        0
    }

    fn len(&self) -> usize {
        0
    }
}

async fn boom() -> &'static str {
    panic!("handler exploded")
}

async fn echo_trace(Extension(ctx): Extension<TraceContext>) -> String {
    ctx.trace_id
}

fn api() -> Router {
    Router::new()
        .route("/api/auth/login", post(|| async { "welcome" }))
        .route("/api/recipes", get(|| async { "[]" }))
        .route("/api/trace", get(echo_trace))
        .route("/api/boom", get(boom))
        .route("/public/menu", get(|| async { "menu" }))
}

struct TestGate {
    state: GateState,
    router: Router,
    recorder: Arc<Recorder>,
    traces: Arc<InMemoryTraceStore>,
}

impl TestGate {
    fn new(config: Config) -> Self {
        let recorder = Arc::new(Recorder::default());
        let traces = Arc::new(InMemoryTraceStore::new(1_000));
        let state = GateState::builder(config)
            .metrics(recorder.clone())
            .logger(recorder.clone())
            .trace_store(traces.clone())
            .build()
            .unwrap();
        let router = mealplan_gate::build_router(state.clone(), api());
        Self {
            state,
            router,
            recorder,
            traces,
        }
    }

    async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(req).await.unwrap()
    }

    async fn shutdown(self) {
        self.state.shutdown().await;
    }
}

fn from_client(method: &str, path: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("x-forwarded-for", ip)
        .header("user-agent", "gate-tests/1.0")
        .body(Body::empty())
        .unwrap()
}

fn header<'a>(response: &'a Response<Body>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

fn trace_id(response: &Response<Body>) -> String {
    header(response, "x-trace-id")
        .expect("x-trace-id missing")
        .to_string()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_auth_quota_then_429() {
    let gate = TestGate::new(Config::default());

    for expected in ["4", "3", "2", "1", "0"] {
        let response = gate
            .send(from_client("POST", "/api/auth/login", "203.0.113.7"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), Some("5"));
        assert_eq!(header(&response, "x-ratelimit-remaining"), Some(expected));
        assert!(header(&response, "x-ratelimit-reset").is_some());
    }

    let response = gate
        .send(from_client("POST", "/api/auth/login", "203.0.113.7"))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("0"));
    let retry_after: u64 = header(&response, "retry-after").unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert!(header(&response, "x-trace-id").is_some());

    let body = json_body(response).await;
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(body["retryAfter"].as_u64(), Some(retry_after));

    assert_eq!(gate.recorder.count(names::RATE_LIMIT_EXCEEDED), 1);
    assert_eq!(gate.recorder.logged(LogLevel::Warn, "security"), 1);
    // Rejections are not errors
    assert_eq!(gate.recorder.count(names::API_ERRORS), 0);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_clients_are_limited_independently() {
    let gate = TestGate::new(Config::default());

    for _ in 0..5 {
        gate.send(from_client("POST", "/api/auth/login", "198.51.100.1"))
            .await;
    }
    let blocked = gate
        .send(from_client("POST", "/api/auth/login", "198.51.100.1"))
        .await;
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = gate
        .send(from_client("POST", "/api/auth/login", "198.51.100.2"))
        .await;
    assert_eq!(other.status(), StatusCode::OK);
    assert_eq!(header(&other, "x-ratelimit-remaining"), Some("4"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_path_is_unlimited() {
    let gate = TestGate::new(Config::default());

    for _ in 0..20 {
        let response = gate
            .send(from_client("GET", "/public/menu", "203.0.113.9"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "x-ratelimit-limit").is_none());
        assert!(header(&response, "x-ratelimit-remaining").is_none());
    }

    gate.shutdown().await;
}

#[tokio::test]
async fn test_disabled_rate_limiting_admits_everything() {
    let gate = TestGate::new(Config {
        rate_limit_enabled: false,
        ..Config::default()
    });

    for _ in 0..10 {
        let response = gate
            .send(from_client("POST", "/api/auth/login", "203.0.113.7"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "x-ratelimit-limit").is_none());
    }

    gate.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_never_exceed_quota() {
    let gate = TestGate::new(Config::default());

    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let router = gate.router.clone();
        tasks.spawn(async move {
            router
                .oneshot(from_client("POST", "/api/auth/login", "192.0.2.55"))
                .await
                .unwrap()
                .status()
        });
    }

    let mut admitted = 0;
    let mut rejected = 0;
    while let Some(status) = tasks.join_next().await {
        match status.unwrap() {
            StatusCode::OK => admitted += 1,
            StatusCode::TOO_MANY_REQUESTS => rejected += 1,
            other => panic!("unexpected status {other}"),
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(rejected, 45);

    gate.shutdown().await;
}

// ============================================================================
// Security Headers
// ============================================================================

#[tokio::test]
async fn test_security_headers_on_every_response() {
    let gate = TestGate::new(Config::default());

    let ok = gate.send(from_client("GET", "/api/recipes", "10.0.0.1")).await;
    let missing = gate.send(from_client("GET", "/nowhere", "10.0.0.1")).await;

    for response in [&ok, &missing] {
        assert_eq!(header(response, "x-content-type-options"), Some("nosniff"));
        assert_eq!(header(response, "x-frame-options"), Some("DENY"));
        assert!(header(response, "content-security-policy").is_some());
        assert!(header(response, "referrer-policy").is_some());
        assert!(header(response, "permissions-policy").is_some());
        // Development: no HSTS
        assert!(header(response, "strict-transport-security").is_none());
    }
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_hsts_in_production() {
    let gate = TestGate::new(Config {
        environment: Environment::Production,
        ..Config::default()
    });

    let response = gate.send(from_client("GET", "/health", "10.0.0.1")).await;
    let hsts = header(&response, "strict-transport-security").unwrap();
    assert!(hsts.contains("max-age="));

    gate.shutdown().await;
}

// ============================================================================
// Trace Propagation
// ============================================================================

#[tokio::test]
async fn test_trace_completed_for_success() {
    let gate = TestGate::new(Config::default());

    let response = gate.send(from_client("GET", "/api/recipes", "10.0.0.2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let id = trace_id(&response);

    let trace = gate.traces.trace(&id).unwrap();
    assert_eq!(trace.status, TraceStatus::Completed);
    assert_eq!(trace.name, "GET /api/recipes");
    assert!(trace.finished_at.is_some());

    let spans = gate.traces.spans(&id);
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].status, TraceStatus::Completed);
    assert_eq!(spans[0].attributes.get("statusCode").map(String::as_str), Some("200"));

    gate.shutdown().await;
}

#[tokio::test]
async fn test_correlation_id_adopted() {
    let gate = TestGate::new(Config::default());

    let req = Request::get("/api/trace")
        .header("x-correlation-id", "checkout-7f3a")
        .header("x-parent-span-id", "span-upstream-1")
        .body(Body::empty())
        .unwrap();
    let response = gate.send(req).await;
    assert_eq!(trace_id(&response), "checkout-7f3a");

    let trace = gate.traces.trace("checkout-7f3a").unwrap();
    assert_eq!(trace.parent_id.as_deref(), Some("span-upstream-1"));

    // Handlers see the same id through the request extension
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"checkout-7f3a");

    gate.shutdown().await;
}

#[tokio::test]
async fn test_request_id_header_is_fallback_correlation() {
    let gate = TestGate::new(Config::default());

    let req = Request::get("/api/trace")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .unwrap();
    let response = gate.send(req).await;
    assert_eq!(trace_id(&response), "req-42");

    gate.shutdown().await;
}

#[tokio::test]
async fn test_invalid_correlation_id_replaced() {
    let gate = TestGate::new(Config::default());

    let req = Request::get("/api/trace")
        .header("x-correlation-id", "not valid; drop table")
        .body(Body::empty())
        .unwrap();
    let response = gate.send(req).await;
    let id = trace_id(&response);
    assert_ne!(id, "not valid; drop table");
    assert_eq!(id.len(), 36);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_reused_correlation_id_traced_per_request() {
    let gate = TestGate::new(Config::default());

    let retry = || {
        Request::get("/api/recipes")
            .header("x-correlation-id", "retry-123")
            .body(Body::empty())
            .unwrap()
    };
    let first = gate.send(retry()).await;
    let second = gate.send(retry()).await;

    assert_eq!(trace_id(&first), "retry-123");
    let second_id = trace_id(&second);
    assert_ne!(second_id, "retry-123");

    let first_trace = gate.traces.trace("retry-123").unwrap();
    assert_eq!(first_trace.status, TraceStatus::Completed);
    assert_eq!(gate.traces.spans("retry-123").len(), 1);

    let second_trace = gate.traces.trace(&second_id).unwrap();
    assert_eq!(second_trace.status, TraceStatus::Completed);
    assert_eq!(
        second_trace.attributes.get("correlationId").map(String::as_str),
        Some("retry-123")
    );

    gate.shutdown().await;
}

#[tokio::test]
async fn test_invalid_correlation_id_falls_back_to_request_id() {
    let gate = TestGate::new(Config::default());

    let req = Request::get("/api/trace")
        .header("x-correlation-id", "not valid")
        .header("x-request-id", "req-77")
        .body(Body::empty())
        .unwrap();
    let response = gate.send(req).await;
    assert_eq!(trace_id(&response), "req-77");

    gate.shutdown().await;
}

#[tokio::test]
async fn test_rejected_request_trace_finished_as_error() {
    let gate = TestGate::new(Config::default());

    for _ in 0..5 {
        gate.send(from_client("POST", "/api/auth/login", "10.1.1.1"))
            .await;
    }
    let response = gate
        .send(from_client("POST", "/api/auth/login", "10.1.1.1"))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let trace = gate.traces.trace(&trace_id(&response)).unwrap();
    assert_eq!(trace.status, TraceStatus::Error);

    gate.shutdown().await;
}

// ============================================================================
// Fail-Safe Errors
// ============================================================================

#[tokio::test]
async fn test_handler_panic_becomes_500() {
    let gate = TestGate::new(Config::default());

    let response = gate.send(from_client("GET", "/api/boom", "10.0.0.3")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(header(&response, "x-content-type-options"), Some("nosniff"));
    let id = trace_id(&response);

    let body = json_body(response).await;
    assert_eq!(body["error"], "Internal Server Error");
    assert_eq!(body["traceId"], id.as_str());
    // Panic text never leaks to the client
    assert!(!body.to_string().contains("exploded"));

    assert_eq!(gate.traces.trace(&id).unwrap().status, TraceStatus::Error);
    assert_eq!(gate.recorder.count(names::API_ERRORS), 1);
    assert_eq!(gate.recorder.logged(LogLevel::Error, "error"), 1);

    // The gate keeps serving after a panic
    let response = gate.send(from_client("GET", "/api/recipes", "10.0.0.3")).await;
    assert_eq!(response.status(), StatusCode::OK);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_failing_collaborators_do_not_affect_responses() {
    let broken = Arc::new(Broken);
    let state = GateState::builder(Config::default())
        .metrics(broken.clone())
        .logger(broken)
        .build()
        .unwrap();
    let router = mealplan_gate::build_router(state.clone(), api());

    let response = router
        .clone()
        .oneshot(from_client("GET", "/api/recipes", "10.0.0.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-limit"));

    for _ in 0..5 {
        router
            .clone()
            .oneshot(from_client("POST", "/api/auth/login", "10.0.0.4"))
            .await
            .unwrap();
    }
    let response = router
        .oneshot(from_client("POST", "/api/auth/login", "10.0.0.4"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    state.shutdown().await;
}

#[tokio::test]
async fn test_request_metrics_recorded() {
    let gate = TestGate::new(Config::default());

    gate.send(from_client("GET", "/api/recipes", "10.0.0.5")).await;

    let counters = gate.recorder.counters.lock().unwrap().clone();
    let statuses: Vec<String> = counters
        .iter()
        .filter(|(name, _)| name == names::API_REQUESTS)
        .filter_map(|(_, labels)| {
            labels
                .iter()
                .find(|(k, _)| k == "status")
                .map(|(_, v)| v.clone())
        })
        .collect();
    assert_eq!(statuses, vec!["pending".to_string(), "200".to_string()]);

    gate.shutdown().await;
}

#[tokio::test]
async fn test_window_store_failure_becomes_500() {
    let recorder = Arc::new(Recorder::default());
    let traces = Arc::new(InMemoryTraceStore::new(100));
    let state = GateState::builder(Config::default())
        .metrics(recorder.clone())
        .logger(recorder.clone())
        .trace_store(traces.clone())
        .window_store(Arc::new(UnreachableStore))
        .build()
        .unwrap();
    let router = mealplan_gate::build_router(state.clone(), api());

    let response = router
        .clone()
        .oneshot(from_client("GET", "/api/recipes", "10.0.0.6"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(header(&response, "content-security-policy").is_some());
    assert!(header(&response, "x-ratelimit-limit").is_none());
    let id = trace_id(&response);

    let body = json_body(response).await;
    assert_eq!(body["error"], "Internal Server Error");
    assert_eq!(body["traceId"], id.as_str());
    assert!(!body.to_string().contains("hunter2"));

    assert_eq!(traces.trace(&id).unwrap().status, TraceStatus::Error);
    assert_eq!(recorder.count(names::API_ERRORS), 1);
    assert_eq!(recorder.logged(LogLevel::Error, "error"), 1);

    // Paths without a policy never reach the store
    let response = router
        .oneshot(from_client("GET", "/public/menu", "10.0.0.6"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.shutdown().await;
}

#[tokio::test]
async fn test_downstream_service_error_becomes_500() {
    let recorder = Arc::new(Recorder::default());
    let traces = Arc::new(InMemoryTraceStore::new(100));
    let state = GateState::builder(Config::default())
        .metrics(recorder.clone())
        .logger(recorder.clone())
        .trace_store(traces.clone())
        .build()
        .unwrap();

    let failing = service_fn(|_req: Request<Body>| async {
        Err::<Response<Body>, _>(std::io::Error::other(
            "connection pool exhausted: postgres://app:hunter2@db/meals",
        ))
    });
    let service = state.gate_layer().layer(failing);

    let response = service
        .oneshot(from_client("GET", "/api/recipes", "10.0.0.7"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(header(&response, "x-frame-options"), Some("DENY"));
    let id = trace_id(&response);

    let body = json_body(response).await;
    assert_eq!(body["error"], "Internal Server Error");
    assert_eq!(body["traceId"], id.as_str());
    assert!(!body.to_string().contains("hunter2"));
    assert!(!body.to_string().contains("postgres"));

    assert_eq!(traces.trace(&id).unwrap().status, TraceStatus::Error);
    assert_eq!(traces.spans(&id)[0].status, TraceStatus::Error);
    assert_eq!(recorder.count(names::API_ERRORS), 1);

    state.shutdown().await;
}

#[tokio::test]
async fn test_panicking_collaborators_do_not_affect_responses() {
    let buggy = Arc::new(Buggy);
    let state = GateState::builder(Config::default())
        .metrics(buggy.clone())
        .logger(buggy.clone())
        .trace_store(buggy)
        .build()
        .unwrap();
    let router = mealplan_gate::build_router(state.clone(), api());

    let response = router
        .clone()
        .oneshot(from_client("GET", "/api/recipes", "10.0.0.8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "x-trace-id").is_some());
    assert_eq!(header(&response, "x-content-type-options"), Some("nosniff"));
    assert_eq!(header(&response, "x-ratelimit-remaining"), Some("99"));

    // Rejection path logs and counts through the same sinks
    for _ in 0..5 {
        router
            .clone()
            .oneshot(from_client("POST", "/api/auth/login", "10.0.0.8"))
            .await
            .unwrap();
    }
    let response = router
        .oneshot(from_client("POST", "/api/auth/login", "10.0.0.8"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    state.shutdown().await;
}
