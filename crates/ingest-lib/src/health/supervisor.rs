//! Periodic health supervision
//!
//! Each cycle walks `Idle -> Checking -> Aggregating -> Alerting -> Idle`:
//! run every probe, fold the results into an [`AggregateHealth`], persist
//! them, then raise alerts for Critical results outside their suppression
//! window. The first cycle runs as soon as the supervisor starts.

use super::{AggregateHealth, Alerter, HealthAlert, HealthCheckResult, HealthCheckSet, HostMetrics, HostMetricsSource, ReadinessResponse};
use crate::observability::{IngestMetrics, StructuredLogger};
use crate::sink::PersistenceSink;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default supervision interval
pub const DEFAULT_SUPERVISION_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the health supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between cycle starts
    pub interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SUPERVISION_INTERVAL,
        }
    }
}

/// Phase of the supervision cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Idle,
    Checking,
    Aggregating,
    Alerting,
}

/// Clears the in-progress flag when a cycle ends, however it ends
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background task handle
struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the health check set on a fixed interval
pub struct HealthSupervisor {
    config: SupervisorConfig,
    checks: HealthCheckSet,
    alerter: Arc<Alerter>,
    host: Option<Arc<dyn HostMetricsSource>>,
    sink: Option<Arc<dyn PersistenceSink>>,
    state: RwLock<SupervisorState>,
    latest: RwLock<Option<AggregateHealth>>,
    cycle_in_progress: AtomicBool,
    running: Mutex<Option<Running>>,
    metrics: IngestMetrics,
    logger: StructuredLogger,
}

impl HealthSupervisor {
    pub fn new(config: SupervisorConfig, checks: HealthCheckSet, alerter: Arc<Alerter>) -> Self {
        Self {
            config,
            checks,
            alerter,
            host: None,
            sink: None,
            state: RwLock::new(SupervisorState::Idle),
            latest: RwLock::new(None),
            cycle_in_progress: AtomicBool::new(false),
            running: Mutex::new(None),
            metrics: IngestMetrics::new(),
            logger: StructuredLogger::new("ingestd"),
        }
    }

    /// Attach host metrics to every aggregate
    pub fn with_host(mut self, host: Arc<dyn HostMetricsSource>) -> Self {
        self.host = Some(host);
        self
    }

    /// Persist every result to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Receive alerts as they are emitted
    pub fn subscribe(&self) -> broadcast::Receiver<HealthAlert> {
        self.alerter.subscribe()
    }

    /// Latest completed aggregate, if any cycle has finished
    pub async fn snapshot(&self) -> Option<AggregateHealth> {
        self.latest.read().await.clone()
    }

    pub async fn state(&self) -> SupervisorState {
        *self.state.read().await
    }

    /// Ready once a cycle has completed
    pub async fn readiness(&self) -> ReadinessResponse {
        if self.latest.read().await.is_some() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some("No health cycle completed yet".to_string()),
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Start the periodic loop; returns false if it was already running
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_loop(shutdown.clone()));
        *running = Some(Running { shutdown, handle });

        info!(
            interval_secs = self.config.interval.as_secs(),
            probes = self.checks.len(),
            "Health supervisor started"
        );
        true
    }

    /// Stop the loop, letting an in-flight cycle finish. Safe to call twice.
    pub async fn stop(&self) {
        let Some(Running { shutdown, handle }) = self.running.lock().await.take() else {
            return;
        };

        shutdown.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Health supervisor task ended abnormally");
        }
        info!("Health supervisor stopped");
    }

    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Cancellation is only observed between cycles
                    self.run_cycle().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("Health supervision loop exiting");
                    break;
                }
            }
        }
    }

    /// Run one full cycle; returns `None` if another cycle is still running
    pub async fn run_cycle(&self) -> Option<AggregateHealth> {
        if self
            .cycle_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Previous health cycle still running, skipping");
            return None;
        }
        let _guard = CycleGuard(&self.cycle_in_progress);
        let started = Instant::now();

        self.set_state(SupervisorState::Checking).await;
        let (checks, host_metrics) = tokio::join!(self.checks.run_all(), self.sample_host());

        self.set_state(SupervisorState::Aggregating).await;
        let aggregate = AggregateHealth::from_checks(checks, host_metrics);
        for check in &aggregate.checks {
            self.metrics
                .set_check_status(check.check.as_str(), check.status.level());
        }
        self.metrics.set_overall_status(aggregate.overall.level());
        self.persist(&aggregate.checks).await;
        *self.latest.write().await = Some(aggregate.clone());

        self.set_state(SupervisorState::Alerting).await;
        let alerts = self.alerter.process(&aggregate.checks);
        for alert in &alerts {
            self.logger.log_alert(alert.check.as_str(), &alert.message);
        }

        self.set_state(SupervisorState::Idle).await;
        self.logger.log_health_cycle(
            aggregate.overall.as_str(),
            aggregate.checks.len(),
            alerts.len(),
            started.elapsed().as_millis() as u64,
        );

        Some(aggregate)
    }

    async fn set_state(&self, state: SupervisorState) {
        *self.state.write().await = state;
    }

    async fn sample_host(&self) -> Option<HostMetrics> {
        let host = self.host.as_ref()?;
        match host.sample().await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!(error = %e, "Host metrics unavailable");
                None
            }
        }
    }

    async fn persist(&self, results: &[HealthCheckResult]) {
        let Some(sink) = &self.sink else {
            return;
        };
        for result in results {
            if let Err(e) = sink.append_health_result(result).await {
                warn!(check = %result.check, error = %e, "Failed to persist health result");
            }
        }
    }
}
