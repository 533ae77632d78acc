//! The probes run every supervision cycle
//!
//! Probes are independent: each one is spawned on its own task, so a slow,
//! failing or panicking probe never blocks or breaks the others. A probe
//! that cannot produce a verdict is reported as `Unknown`.

use super::{CheckKind, HealthCheckResult, HealthStatus, HealthThresholds, HostMetricsSource};
use crate::error::{IngestError, Result};
use crate::limiter::{QuotaTracker, Transport};
use crate::sink::PersistenceSink;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// One independent health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn kind(&self) -> CheckKind;

    /// Produce a verdict; an `Err` is reported as `Unknown`
    async fn check(&self) -> Result<HealthCheckResult>;
}

/// The fixed probe collection for one supervisor
#[derive(Default, Clone)]
pub struct HealthCheckSet {
    probes: Vec<Arc<dyn HealthProbe>>,
}

impl HealthCheckSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Run every probe concurrently; results follow registration order
    pub async fn run_all(&self) -> Vec<HealthCheckResult> {
        let handles: Vec<_> = self
            .probes
            .iter()
            .map(|probe| {
                let probe = probe.clone();
                let kind = probe.kind();
                let handle = tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = probe.check().await;
                    (outcome, started.elapsed())
                });
                (kind, handle)
            })
            .collect();

        join_all(handles.into_iter().map(|(kind, handle)| async move {
            match handle.await {
                Ok((Ok(result), elapsed)) => {
                    if result.latency_ms == 0 {
                        result.with_latency(elapsed.as_millis() as u64)
                    } else {
                        result
                    }
                }
                Ok((Err(e), elapsed)) => {
                    warn!(check = %kind, error = %e, "Health probe failed");
                    HealthCheckResult::unknown(kind, e).with_latency(elapsed.as_millis() as u64)
                }
                Err(e) => {
                    warn!(check = %kind, error = %e, "Health probe task aborted");
                    HealthCheckResult::unknown(kind, format!("probe task aborted: {}", e))
                }
            }
        }))
        .await
    }
}

/// Database reachability and connection pool contention
pub struct DatabaseProbe {
    sink: Arc<dyn PersistenceSink>,
    thresholds: HealthThresholds,
}

impl DatabaseProbe {
    pub fn new(sink: Arc<dyn PersistenceSink>, thresholds: HealthThresholds) -> Self {
        Self { sink, thresholds }
    }
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::Database
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let pool = self.sink.pool_stats();
        let pool_details = json!({
            "size": pool.size,
            "idle": pool.idle,
            "waiting": pool.waiting,
        });

        let latency = match self.sink.ping().await {
            Ok(latency) => latency,
            Err(e) => {
                return Ok(HealthCheckResult::new(
                    CheckKind::Database,
                    HealthStatus::Critical,
                    format!("Database unreachable: {}", e),
                )
                .with_detail("pool", pool_details));
            }
        };

        let result = if pool.waiting > self.thresholds.pool_waiting_warning {
            HealthCheckResult::new(
                CheckKind::Database,
                HealthStatus::Warning,
                format!("{} callers waiting for a connection", pool.waiting),
            )
        } else {
            HealthCheckResult::new(CheckKind::Database, HealthStatus::Healthy, "Database reachable")
        };

        Ok(result
            .with_detail("pool", pool_details)
            .with_latency(latency.as_millis() as u64))
    }
}

/// Upstream reachability through one quota-gated call
pub struct ApiProbe {
    transport: Arc<dyn Transport>,
    quota: Arc<QuotaTracker>,
    endpoint: String,
    slow_after: Duration,
}

impl ApiProbe {
    pub fn new(transport: Arc<dyn Transport>, quota: Arc<QuotaTracker>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            quota,
            endpoint: endpoint.into(),
            slow_after: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl HealthProbe for ApiProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::Api
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        self.quota.acquire().await?;

        let started = Instant::now();
        let outcome = self.transport.send(&self.endpoint, &[]).await;
        let latency = started.elapsed();
        let latency_ms = latency.as_millis() as u64;

        let result = match outcome.map_err(IngestError::from) {
            Ok(_) if latency > self.slow_after => HealthCheckResult::new(
                CheckKind::Api,
                HealthStatus::Warning,
                format!("API responding slowly ({} ms)", latency_ms),
            ),
            Ok(_) => HealthCheckResult::new(CheckKind::Api, HealthStatus::Healthy, "API reachable"),
            Err(IngestError::RateLimitedByUpstream(e)) => HealthCheckResult::new(
                CheckKind::Api,
                HealthStatus::Warning,
                format!("API rate limited: {}", e),
            ),
            Err(e) => HealthCheckResult::new(
                CheckKind::Api,
                HealthStatus::Critical,
                format!("API unreachable: {}", e),
            ),
        };

        Ok(result
            .with_detail("endpoint", self.endpoint.clone())
            .with_latency(latency_ms))
    }
}

/// Used space on the disk holding the data directory
pub struct DiskSpaceProbe {
    host: Arc<dyn HostMetricsSource>,
    thresholds: HealthThresholds,
}

impl DiskSpaceProbe {
    pub fn new(host: Arc<dyn HostMetricsSource>, thresholds: HealthThresholds) -> Self {
        Self { host, thresholds }
    }
}

#[async_trait]
impl HealthProbe for DiskSpaceProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::DiskSpace
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let metrics = self.host.sample().await?;
        let disk = metrics.disk.ok_or_else(|| {
            IngestError::probe_unavailable(CheckKind::DiskSpace, "no mounted disk holds the data path")
        })?;

        let status = HealthStatus::from_thresholds(
            disk.used_percent,
            self.thresholds.disk_warning_percent,
            self.thresholds.disk_critical_percent,
        );
        Ok(HealthCheckResult::new(
            CheckKind::DiskSpace,
            status,
            format!("Disk {} is {:.1}% used", disk.mount, disk.used_percent),
        )
        .with_detail("mount", disk.mount)
        .with_detail("used_percent", disk.used_percent)
        .with_detail("available_bytes", disk.available_bytes))
    }
}

/// Host memory usage
pub struct MemoryProbe {
    host: Arc<dyn HostMetricsSource>,
    thresholds: HealthThresholds,
}

impl MemoryProbe {
    pub fn new(host: Arc<dyn HostMetricsSource>, thresholds: HealthThresholds) -> Self {
        Self { host, thresholds }
    }
}

#[async_trait]
impl HealthProbe for MemoryProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::Memory
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let metrics = self.host.sample().await?;
        let status = HealthStatus::from_thresholds(
            metrics.memory_used_percent,
            self.thresholds.memory_warning_percent,
            self.thresholds.memory_critical_percent,
        );

        Ok(HealthCheckResult::new(
            CheckKind::Memory,
            status,
            format!("Memory {:.1}% used", metrics.memory_used_percent),
        )
        .with_detail("used_percent", metrics.memory_used_percent)
        .with_detail("used_bytes", metrics.memory_used_bytes)
        .with_detail("total_bytes", metrics.memory_total_bytes))
    }
}

/// Age of the newest write in the stalest tracked dataset
pub struct DataFreshnessProbe {
    sink: Arc<dyn PersistenceSink>,
    tracked: Vec<String>,
    thresholds: HealthThresholds,
}

impl DataFreshnessProbe {
    /// An empty `tracked` list grades every dataset that has rows
    pub fn new(sink: Arc<dyn PersistenceSink>, tracked: Vec<String>, thresholds: HealthThresholds) -> Self {
        Self {
            sink,
            tracked,
            thresholds,
        }
    }

    fn grade_hours(&self, hours: f64) -> HealthStatus {
        HealthStatus::from_thresholds(
            hours,
            self.thresholds.freshness_warning_hours,
            self.thresholds.freshness_critical_hours,
        )
    }
}

#[async_trait]
impl HealthProbe for DataFreshnessProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::DataFreshness
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let tables = self.sink.query_freshness().await?;
        let now = Utc::now();

        let names: Vec<String> = if self.tracked.is_empty() {
            tables.iter().map(|t| t.table.clone()).collect()
        } else {
            self.tracked.clone()
        };
        if names.is_empty() {
            return Ok(HealthCheckResult::new(
                CheckKind::DataFreshness,
                HealthStatus::Healthy,
                "No datasets tracked yet",
            ));
        }

        let mut worst = HealthStatus::Healthy;
        let mut worst_message = String::from("All tracked datasets are fresh");
        let mut per_table = serde_json::Map::new();

        for name in &names {
            let hours = tables
                .iter()
                .find(|t| &t.table == name)
                .and_then(|t| t.hours_since_write(now));

            let (status, message) = match hours {
                Some(hours) => {
                    per_table.insert(name.clone(), json!(hours));
                    (
                        self.grade_hours(hours),
                        format!("{} last written {:.1}h ago", name, hours),
                    )
                }
                None => {
                    per_table.insert(name.clone(), serde_json::Value::Null);
                    (HealthStatus::Warning, format!("{} has no data", name))
                }
            };

            if status.level() > worst.level() {
                worst = status;
                worst_message = message;
            }
        }

        Ok(
            HealthCheckResult::new(CheckKind::DataFreshness, worst, worst_message)
                .with_detail("hours_since_write", per_table),
        )
    }
}

/// Share of the per-minute quota already consumed
pub struct RateLimitProbe {
    quota: Arc<QuotaTracker>,
    thresholds: HealthThresholds,
}

impl RateLimitProbe {
    pub fn new(quota: Arc<QuotaTracker>, thresholds: HealthThresholds) -> Self {
        Self { quota, thresholds }
    }
}

#[async_trait]
impl HealthProbe for RateLimitProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::RateLimit
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let snapshot = self.quota.snapshot().await;
        let percent = snapshot.minute_usage_percent();
        let status = HealthStatus::from_thresholds(
            percent,
            self.thresholds.rate_limit_warning_percent,
            self.thresholds.rate_limit_critical_percent,
        );

        Ok(HealthCheckResult::new(
            CheckKind::RateLimit,
            status,
            format!(
                "{}/{} calls this minute ({:.1}%)",
                snapshot.per_minute_count, snapshot.per_minute_cap, percent
            ),
        )
        .with_detail("used_percent", percent)
        .with_detail("remaining", snapshot.remaining_this_minute()))
    }
}

/// Failed upstream calls over the trailing window
pub struct ErrorRateProbe {
    sink: Arc<dyn PersistenceSink>,
    thresholds: HealthThresholds,
}

impl ErrorRateProbe {
    pub fn new(sink: Arc<dyn PersistenceSink>, thresholds: HealthThresholds) -> Self {
        Self { sink, thresholds }
    }
}

#[async_trait]
impl HealthProbe for ErrorRateProbe {
    fn kind(&self) -> CheckKind {
        CheckKind::ErrorRate
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let window = self.thresholds.error_window_hours;
        let errors = self.sink.query_recent_error_count(window).await?;

        let status = if errors > self.thresholds.error_critical_count {
            HealthStatus::Critical
        } else if errors > self.thresholds.error_warning_count {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        Ok(HealthCheckResult::new(
            CheckKind::ErrorRate,
            status,
            format!("{} failed calls in the last {}h", errors, window),
        )
        .with_detail("errors", errors)
        .with_detail("window_hours", window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::health::{DiskUsage, HostMetrics, OverallStatus};
    use crate::models::{CallRecord, DataRecord};
    use crate::sink::{PoolStats, TableFreshness};
    use chrono::{DateTime, Duration as ChronoDuration};
    use serde_json::Value;

    /// Sink with canned answers for the read side
    #[derive(Default)]
    struct FakeSink {
        freshness: Vec<TableFreshness>,
        errors: u64,
        unreachable: bool,
        pool: PoolStats,
    }

    #[async_trait]
    impl PersistenceSink for FakeSink {
        async fn upsert(&self, _record: &DataRecord) -> Result<()> {
            Ok(())
        }

        async fn append_health_result(&self, _result: &HealthCheckResult) -> Result<()> {
            Ok(())
        }

        async fn append_call_record(&self, _record: &CallRecord) -> Result<()> {
            Ok(())
        }

        async fn prune_call_records(&self, _older_than: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }

        async fn query_freshness(&self) -> Result<Vec<TableFreshness>> {
            Ok(self.freshness.clone())
        }

        async fn query_recent_error_count(&self, _window_hours: u32) -> Result<u64> {
            if self.unreachable {
                return Err(IngestError::persistence("database is locked"));
            }
            Ok(self.errors)
        }

        async fn recent_health_results(&self, _limit: usize) -> Result<Vec<HealthCheckResult>> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<Duration> {
            if self.unreachable {
                return Err(IngestError::persistence("connection refused"));
            }
            Ok(Duration::from_millis(2))
        }

        fn pool_stats(&self) -> PoolStats {
            self.pool
        }
    }

    struct FixedHost(HostMetrics);

    #[async_trait]
    impl HostMetricsSource for FixedHost {
        async fn sample(&self) -> Result<HostMetrics> {
            Ok(self.0.clone())
        }
    }

    struct FixedTransport(std::result::Result<Value, TransportError>);

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(
            &self,
            _endpoint: &str,
            _params: &[(String, String)],
        ) -> std::result::Result<Value, TransportError> {
            self.0.clone()
        }
    }

    struct FailingProbe;

    #[async_trait]
    impl HealthProbe for FailingProbe {
        fn kind(&self) -> CheckKind {
            CheckKind::Api
        }

        async fn check(&self) -> Result<HealthCheckResult> {
            Err(IngestError::probe_unavailable(CheckKind::Api, "resolver timeout"))
        }
    }

    struct PanickingProbe;

    #[async_trait]
    impl HealthProbe for PanickingProbe {
        fn kind(&self) -> CheckKind {
            CheckKind::Memory
        }

        async fn check(&self) -> Result<HealthCheckResult> {
            panic!("probe bug");
        }
    }

    fn host(memory_percent: f64, disk_percent: Option<f64>) -> Arc<dyn HostMetricsSource> {
        Arc::new(FixedHost(HostMetrics {
            memory_total_bytes: 1_000,
            memory_used_bytes: (memory_percent * 10.0) as u64,
            memory_used_percent: memory_percent,
            disk: disk_percent.map(|used_percent| DiskUsage {
                mount: "/".to_string(),
                total_bytes: 100,
                available_bytes: (100.0 - used_percent) as u64,
                used_percent,
            }),
        }))
    }

    fn freshness(table: &str, hours_ago: Option<i64>) -> TableFreshness {
        TableFreshness {
            table: table.to_string(),
            last_write: hours_ago.map(|h| Utc::now() - ChronoDuration::hours(h)),
            row_count: 1,
        }
    }

    #[tokio::test]
    async fn test_memory_and_disk_thresholds() {
        let t = HealthThresholds::default();

        let memory = MemoryProbe::new(host(85.0, Some(10.0)), t.clone()).check().await.unwrap();
        assert_eq!(memory.status, HealthStatus::Warning);

        let disk = DiskSpaceProbe::new(host(10.0, Some(95.0)), t.clone()).check().await.unwrap();
        assert_eq!(disk.status, HealthStatus::Critical);
        assert_eq!(disk.details["mount"], "/");

        let missing = DiskSpaceProbe::new(host(10.0, None), t).check().await;
        assert!(matches!(missing, Err(IngestError::ProbeUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_database_probe_grades_pool_contention() {
        let sink = Arc::new(FakeSink {
            pool: PoolStats {
                size: 5,
                idle: 0,
                waiting: 6,
            },
            ..Default::default()
        });
        let result = DatabaseProbe::new(sink, HealthThresholds::default())
            .check()
            .await
            .unwrap();
        assert_eq!(result.status, HealthStatus::Warning);
        assert_eq!(result.details["pool"]["waiting"], 6);

        let down = Arc::new(FakeSink {
            unreachable: true,
            ..Default::default()
        });
        let result = DatabaseProbe::new(down, HealthThresholds::default())
            .check()
            .await
            .unwrap();
        assert_eq!(result.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_freshness_takes_worst_tracked_table() {
        let sink = Arc::new(FakeSink {
            freshness: vec![freshness("quotes", Some(2)), freshness("prices", Some(30))],
            ..Default::default()
        });
        let probe = DataFreshnessProbe::new(
            sink.clone(),
            vec!["quotes".to_string(), "prices".to_string()],
            HealthThresholds::default(),
        );
        let result = probe.check().await.unwrap();
        assert_eq!(result.status, HealthStatus::Warning);
        assert!(result.message.starts_with("prices"));

        let stale = Arc::new(FakeSink {
            freshness: vec![freshness("quotes", Some(49))],
            ..Default::default()
        });
        let result = DataFreshnessProbe::new(stale, Vec::new(), HealthThresholds::default())
            .check()
            .await
            .unwrap();
        assert_eq!(result.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_freshness_flags_tracked_table_without_rows() {
        let sink = Arc::new(FakeSink {
            freshness: vec![freshness("quotes", Some(1))],
            ..Default::default()
        });
        let result = DataFreshnessProbe::new(
            sink,
            vec!["quotes".to_string(), "profiles".to_string()],
            HealthThresholds::default(),
        )
        .check()
        .await
        .unwrap();

        assert_eq!(result.status, HealthStatus::Warning);
        assert_eq!(result.message, "profiles has no data");
        assert!(result.details["hours_since_write"]["profiles"].is_null());
    }

    #[tokio::test]
    async fn test_error_rate_thresholds() {
        let grade = |errors| async move {
            let sink = Arc::new(FakeSink {
                errors,
                ..Default::default()
            });
            ErrorRateProbe::new(sink, HealthThresholds::default())
                .check()
                .await
                .unwrap()
                .status
        };

        assert_eq!(grade(5).await, HealthStatus::Healthy);
        assert_eq!(grade(6).await, HealthStatus::Warning);
        assert_eq!(grade(10).await, HealthStatus::Warning);
        assert_eq!(grade(11).await, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_rate_limit_probe_reads_quota() {
        let quota = Arc::new(QuotaTracker::new(10, 100));
        for _ in 0..8 {
            quota.acquire().await.unwrap();
        }

        let result = RateLimitProbe::new(quota, HealthThresholds::default())
            .check()
            .await
            .unwrap();
        assert_eq!(result.status, HealthStatus::Warning);
        assert_eq!(result.details["remaining"], 2);
    }

    #[tokio::test]
    async fn test_api_probe_classifies_transport_outcomes() {
        let quota = Arc::new(QuotaTracker::new(100, 100));
        let probe = |outcome| {
            ApiProbe::new(Arc::new(FixedTransport(outcome)), quota.clone(), "quote/AAPL")
        };

        let ok = probe(Ok(json!([]))).check().await.unwrap();
        assert_eq!(ok.status, HealthStatus::Healthy);

        let limited = probe(Err(TransportError::rate_limited())).check().await.unwrap();
        assert_eq!(limited.status, HealthStatus::Warning);

        let down = probe(Err(TransportError::network("dns failure"))).check().await.unwrap();
        assert_eq!(down.status, HealthStatus::Critical);

        assert_eq!(quota.snapshot().await.per_minute_count, 3);
    }

    #[tokio::test]
    async fn test_failed_and_panicking_probes_become_unknown() {
        let set = HealthCheckSet::new()
            .with_probe(Arc::new(FailingProbe))
            .with_probe(Arc::new(PanickingProbe))
            .with_probe(Arc::new(ErrorRateProbe::new(
                Arc::new(FakeSink {
                    errors: 7,
                    ..Default::default()
                }),
                HealthThresholds::default(),
            )));

        let results = set.run_all().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].check, CheckKind::Api);
        assert_eq!(results[0].status, HealthStatus::Unknown);
        assert!(results[0].message.contains("resolver timeout"));
        assert_eq!(results[1].status, HealthStatus::Unknown);
        assert_eq!(results[2].status, HealthStatus::Warning);

        // Unknown verdicts leave the aggregate to the remaining probes
        assert_eq!(OverallStatus::from_checks(&results), OverallStatus::Warning);
    }
}
