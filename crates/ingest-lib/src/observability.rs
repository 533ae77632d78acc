//! Observability infrastructure for the ingestion pipeline
//!
//! Provides:
//! - Prometheus metrics (upstream calls, quota waits, batch items, health verdicts, alerts)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for upstream request latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Histogram buckets for time spent waiting on the quota (in seconds)
const QUOTA_WAIT_BUCKETS: &[f64] = &[0.0, 0.05, 0.25, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<IngestMetricsInner> = OnceLock::new();

struct IngestMetricsInner {
    upstream_requests: IntCounterVec,
    upstream_request_latency_seconds: Histogram,
    quota_wait_seconds: Histogram,
    quota_minute_usage: IntGauge,
    usage_log_entries: IntGauge,
    batch_items: IntCounterVec,
    health_check_status: IntGaugeVec,
    health_overall_status: IntGauge,
    alerts_emitted: IntCounterVec,
    alerts_suppressed: IntCounter,
}

impl IngestMetricsInner {
    fn new() -> Self {
        Self {
            upstream_requests: register_int_counter_vec!(
                "ingest_upstream_requests_total",
                "Upstream call attempts by outcome",
                &["outcome"]
            )
            .expect("Failed to register upstream_requests_total"),

            upstream_request_latency_seconds: register_histogram!(
                "ingest_upstream_request_latency_seconds",
                "Latency of individual upstream call attempts",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register upstream_request_latency_seconds"),

            quota_wait_seconds: register_histogram!(
                "ingest_quota_wait_seconds",
                "Time callers spent suspended waiting for a quota slot",
                QUOTA_WAIT_BUCKETS.to_vec()
            )
            .expect("Failed to register quota_wait_seconds"),

            quota_minute_usage: register_int_gauge!(
                "ingest_quota_minute_usage",
                "Slots granted in the current 60-second window"
            )
            .expect("Failed to register quota_minute_usage"),

            usage_log_entries: register_int_gauge!(
                "ingest_usage_log_entries",
                "Call records currently retained in the usage log"
            )
            .expect("Failed to register usage_log_entries"),

            batch_items: register_int_counter_vec!(
                "ingest_batch_items_total",
                "Batch items processed by outcome",
                &["outcome"]
            )
            .expect("Failed to register batch_items_total"),

            health_check_status: register_int_gauge_vec!(
                "ingest_health_check_status",
                "Latest status per check (0 healthy, 1 warning, 2 critical, 3 unknown)",
                &["check"]
            )
            .expect("Failed to register health_check_status"),

            health_overall_status: register_int_gauge!(
                "ingest_health_overall_status",
                "Latest aggregate status (0 healthy, 1 warning, 2 critical)"
            )
            .expect("Failed to register health_overall_status"),

            alerts_emitted: register_int_counter_vec!(
                "ingest_alerts_emitted_total",
                "Alerts emitted by check kind",
                &["check"]
            )
            .expect("Failed to register alerts_emitted_total"),

            alerts_suppressed: register_int_counter!(
                "ingest_alerts_suppressed_total",
                "Critical results that fell inside the suppression window"
            )
            .expect("Failed to register alerts_suppressed_total"),
        }
    }
}

/// Ingestion metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct IngestMetrics {
    _private: (),
}

impl Default for IngestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(IngestMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &IngestMetricsInner {
        GLOBAL_METRICS.get_or_init(IngestMetricsInner::new)
    }

    /// Count one upstream attempt; `outcome` is success, failure or rate_limited
    pub fn inc_upstream_request(&self, outcome: &str) {
        self.inner()
            .upstream_requests
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn observe_request_latency(&self, duration_secs: f64) {
        self.inner()
            .upstream_request_latency_seconds
            .observe(duration_secs);
    }

    pub fn observe_quota_wait(&self, duration_secs: f64) {
        self.inner().quota_wait_seconds.observe(duration_secs);
    }

    pub fn set_quota_minute_usage(&self, count: i64) {
        self.inner().quota_minute_usage.set(count);
    }

    pub fn set_usage_log_entries(&self, count: i64) {
        self.inner().usage_log_entries.set(count);
    }

    /// Count one finished batch item; `outcome` is succeeded or failed
    pub fn inc_batch_item(&self, outcome: &str) {
        self.inner().batch_items.with_label_values(&[outcome]).inc();
    }

    pub fn set_check_status(&self, check: &str, level: i64) {
        self.inner()
            .health_check_status
            .with_label_values(&[check])
            .set(level);
    }

    pub fn set_overall_status(&self, level: i64) {
        self.inner().health_overall_status.set(level);
    }

    pub fn inc_alert_emitted(&self, check: &str) {
        self.inner()
            .alerts_emitted
            .with_label_values(&[check])
            .inc();
    }

    pub fn inc_alert_suppressed(&self) {
        self.inner().alerts_suppressed.inc();
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Structured logger for pipeline events
///
/// Emits the domain events with a stable `event` field so they can be
/// filtered out of the JSON log stream.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log daemon startup
    pub fn log_startup(&self, version: &str, per_minute_cap: u32, per_second_cap: u32) {
        info!(
            event = "daemon_started",
            instance = %self.instance,
            version = %version,
            per_minute_cap = per_minute_cap,
            per_second_cap = per_second_cap,
            "Ingestion daemon started"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Ingestion daemon shutting down"
        );
    }

    /// Log a finished supervision cycle
    pub fn log_health_cycle(&self, overall: &str, checks: usize, alerts: usize, duration_ms: u64) {
        info!(
            event = "health_cycle_completed",
            instance = %self.instance,
            overall = %overall,
            checks = checks,
            alerts = alerts,
            duration_ms = duration_ms,
            "Health cycle completed"
        );
    }

    /// Log an emitted alert
    pub fn log_alert(&self, check: &str, message: &str) {
        warn!(
            event = "health_alert",
            instance = %self.instance,
            check = %check,
            message = %message,
            "Critical health alert emitted"
        );
    }

    /// Log a finished dataset load
    pub fn log_dataset_loaded(
        &self,
        dataset: &str,
        succeeded: usize,
        failed: usize,
        records_written: usize,
    ) {
        if failed == 0 {
            info!(
                event = "dataset_loaded",
                instance = %self.instance,
                dataset = %dataset,
                succeeded = succeeded,
                failed = failed,
                records_written = records_written,
                "Dataset loaded"
            );
        } else {
            warn!(
                event = "dataset_loaded",
                instance = %self.instance,
                dataset = %dataset,
                succeeded = succeeded,
                failed = failed,
                records_written = records_written,
                "Dataset loaded with failures"
            );
        }
    }

    /// Log a usage log pruning pass that removed entries
    pub fn log_usage_pruned(&self, removed: usize, remaining: usize) {
        info!(
            event = "usage_pruned",
            instance = %self.instance,
            removed = removed,
            remaining = remaining,
            "Pruned usage log"
        );
    }
}
