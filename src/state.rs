//! Shared gate state: collaborators, the built gate layer, background tasks.
//!
//! # Collaborators
//!
//! [`GateState::new`] wires the default collaborators: the Prometheus metrics
//! sink, the `tracing` logger, and in-memory window and trace stores.
//! [`GateState::builder`] lets an embedding application (or a test) supply
//! its own.
//!
//! # Structured Concurrency
//!
//! The expired-window sweep runs as a background task managed by a
//! `tokio_util::task::TaskTracker` and stopped through a `CancellationToken`.
//! Call `shutdown()` before exit to stop it cleanly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::error::AppResult;
use crate::logging::{StructuredLogger, TracingLogger};
use crate::metrics::{MetricsSink, PrometheusSink, set_active_windows};
use crate::middleware::{GateLayer, TrustedProxyConfig};
use crate::policy::PolicyTable;
use crate::security_headers::SecurityHeaders;
use crate::telemetry::Telemetry;
use crate::trace::{InMemoryTraceStore, TraceOrchestrator, TraceStore};
use crate::window_store::{InMemoryWindowStore, WindowStore, now_ms};

/// Shared state of the gate and its support routes.
///
/// Cheap to clone; every clone shares the same stores and tasks.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = GateState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;  // Wait for background tasks to complete
/// ```
#[derive(Clone)]
pub struct GateState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Timestamp when the application started
    pub started_at: Instant,
    gate: GateLayer,
    admission: AdmissionController,
    orchestrator: TraceOrchestrator,
    telemetry: Telemetry,
    window_store: Arc<dyn WindowStore>,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl GateState {
    /// Create state with the default collaborators.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidPolicy` if the configured policy table is
    /// invalid.
    pub fn new(config: Config) -> AppResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> GateStateBuilder {
        GateStateBuilder {
            config,
            metrics: None,
            logger: None,
            trace_store: None,
            window_store: None,
            policies: None,
        }
    }

    /// The gate layer to wrap a router with.
    pub fn gate_layer(&self) -> GateLayer {
        self.gate.clone()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn orchestrator(&self) -> &TraceOrchestrator {
        &self.orchestrator
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn window_store(&self) -> &Arc<dyn WindowStore> {
        &self.window_store
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Spawn the periodic expired-window sweep.
    ///
    /// Keeps the store bounded even when no request arrives to trigger the
    /// inline sweep. Also refreshes the `rate_limit_active_windows` gauge.
    fn spawn_sweep_task(&self, every: Duration) {
        let store = self.window_store.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Window sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.sweep_expired(now_ms());
                        let live = store.len();
                        set_active_windows(live);
                        trace!(removed, live, "Swept expired rate limit windows");
                    }
                }
            }

            debug!("Window sweep task shutting down");
        });
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// This method:
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker (prevents new tasks)
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }
}

/// Builder for [`GateState`] with replaceable collaborators.
pub struct GateStateBuilder {
    config: Config,
    metrics: Option<Arc<dyn MetricsSink>>,
    logger: Option<Arc<dyn StructuredLogger>>,
    trace_store: Option<Arc<dyn TraceStore>>,
    window_store: Option<Arc<dyn WindowStore>>,
    policies: Option<PolicyTable>,
}

impl GateStateBuilder {
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn StructuredLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.trace_store = Some(store);
        self
    }

    pub fn window_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.window_store = Some(store);
        self
    }

    /// Use `policies` instead of the table derived from the configuration.
    pub fn policies(mut self, policies: PolicyTable) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Assemble the state and start background tasks.
    ///
    /// The sweep task is only started inside a Tokio runtime and when the
    /// configured sweep interval is non-zero.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidPolicy` if the policy table is invalid.
    pub fn build(self) -> AppResult<GateState> {
        let config = self.config;

        let policies = match self.policies {
            Some(policies) => policies,
            None => PolicyTable::from_config(&config)?,
        };
        info!(
            policies = policies.len(),
            enabled = config.rate_limit_enabled,
            override_applied = config.rate_limit_override.is_some(),
            "Rate limit policy table loaded"
        );

        let telemetry = Telemetry::new(
            self.metrics.unwrap_or_else(|| Arc::new(PrometheusSink)),
            self.logger.unwrap_or_else(|| Arc::new(TracingLogger)),
        );
        let window_store = self.window_store.unwrap_or_else(|| {
            Arc::new(InMemoryWindowStore::new(config.rate_limit_sweep_interval))
        });
        let trace_store = self
            .trace_store
            .unwrap_or_else(|| Arc::new(InMemoryTraceStore::new(config.trace_store_capacity)));

        let mut admission =
            AdmissionController::new(Arc::new(policies), window_store.clone(), telemetry.clone());
        if !config.rate_limit_enabled {
            warn!("Rate limiting is disabled");
            admission = admission.disabled();
        }
        let orchestrator = TraceOrchestrator::new(trace_store);

        let gate = GateLayer::new(
            admission.clone(),
            orchestrator.clone(),
            telemetry.clone(),
            SecurityHeaders::build(config.environment),
            TrustedProxyConfig::new(&config.trusted_proxies),
        );

        let sweep_every = config.rate_limit_sweep_interval;
        let state = GateState {
            config: Arc::new(config),
            started_at: Instant::now(),
            gate,
            admission,
            orchestrator,
            telemetry,
            window_store,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        if sweep_every.is_zero() {
            debug!("Sweep interval is zero, relying on inline sweeps");
        } else if tokio::runtime::Handle::try_current().is_ok() {
            state.spawn_sweep_task(sweep_every);
        } else {
            warn!("No Tokio runtime, background window sweep not started");
        }

        Ok(state)
    }
}
