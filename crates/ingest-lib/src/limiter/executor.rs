//! Request execution with quota gating, retry and backoff
//!
//! One logical request acquires a single quota slot, then makes up to
//! `retry_attempts` transport calls:
//! - success: record, pace, return the payload
//! - 429: record, sit out the fixed cooldown, try again
//! - anything else: record, back off linearly (`base * attempt`), try again

use super::{QuotaTracker, RateLimiterConfig, UsageRecorder};
use crate::error::{IngestError, Result, TransportError};
use crate::models::{CallRecord, UsageSnapshot};
use crate::observability::IngestMetrics;
use crate::sink::PersistenceSink;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Window used for the "last minute" figures of [`UsageSnapshot`]
const SNAPSHOT_WINDOW: Duration = Duration::from_secs(60);

/// Network client for the upstream API
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one call; the implementation owns credentials
    async fn send(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> std::result::Result<Value, TransportError>;
}

/// Issues rate-limited upstream requests and records every attempt
pub struct RequestExecutor {
    config: RateLimiterConfig,
    transport: Arc<dyn Transport>,
    quota: Arc<QuotaTracker>,
    usage: Arc<UsageRecorder>,
    sink: Option<Arc<dyn PersistenceSink>>,
    metrics: IngestMetrics,
}

impl RequestExecutor {
    /// Create an executor with its own quota tracker and usage log
    pub fn new(config: RateLimiterConfig, transport: Arc<dyn Transport>) -> Self {
        let quota = Arc::new(QuotaTracker::new(
            config.per_minute_cap,
            config.per_second_cap,
        ));
        Self {
            config,
            transport,
            quota,
            usage: Arc::new(UsageRecorder::default()),
            sink: None,
            metrics: IngestMetrics::new(),
        }
    }

    /// Share an existing usage log instead of the private one
    pub fn with_usage(mut self, usage: Arc<UsageRecorder>) -> Self {
        self.usage = usage;
        self
    }

    /// Mirror every attempt into the sink's call log
    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn quota(&self) -> Arc<QuotaTracker> {
        self.quota.clone()
    }

    pub fn usage(&self) -> Arc<UsageRecorder> {
        self.usage.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Execute one logical request, failing with `ExhaustedRetries` once
    /// every attempt has been used
    pub async fn execute(&self, endpoint: &str, params: &[(String, String)]) -> Result<Value> {
        self.quota.acquire().await?;

        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = TransportError::network("no attempt made");

        for attempt in 1..=attempts {
            let started = Instant::now();
            let outcome = self.transport.send(endpoint, params).await;
            let latency_ms = started.elapsed().as_millis() as u64;
            self.metrics
                .observe_request_latency(started.elapsed().as_secs_f64());

            match outcome {
                Ok(payload) => {
                    self.record_attempt(CallRecord::success(endpoint, latency_ms))
                        .await;
                    self.metrics.inc_upstream_request("success");
                    debug!(endpoint = %endpoint, attempt = attempt, latency_ms = latency_ms, "Upstream call succeeded");

                    sleep(self.config.request_pacing).await;
                    return Ok(payload);
                }
                Err(err) if err.is_rate_limited() => {
                    self.record_attempt(CallRecord::failure(endpoint, latency_ms, err.status_code))
                        .await;
                    self.metrics.inc_upstream_request("rate_limited");

                    let is_final = attempt == attempts;
                    warn!(
                        endpoint = %endpoint,
                        attempt = attempt,
                        cooldown_secs = self.config.rate_limit_cooldown.as_secs(),
                        final_attempt = is_final,
                        "Rate limited by upstream"
                    );
                    if !is_final || self.config.cooldown_on_final_attempt {
                        sleep(self.config.rate_limit_cooldown).await;
                    }
                    last_error = err;
                }
                Err(err) => {
                    self.record_attempt(CallRecord::failure(endpoint, latency_ms, err.status_code))
                        .await;
                    self.metrics.inc_upstream_request("failure");

                    warn!(
                        endpoint = %endpoint,
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %err,
                        "Upstream call failed"
                    );
                    if attempt < attempts {
                        sleep(self.config.retry_base_delay * attempt).await;
                    }
                    last_error = err;
                }
            }
        }

        Err(IngestError::ExhaustedRetries {
            attempts,
            last_error,
        })
    }

    /// Current quota and call statistics for the snapshot publisher
    pub async fn usage_snapshot(&self) -> UsageSnapshot {
        let quota = self.quota.snapshot().await;
        let stats = self.usage.stats_since(SNAPSHOT_WINDOW).await;

        UsageSnapshot {
            current_minute_calls: quota.per_minute_count,
            remaining_calls_this_minute: quota.remaining_this_minute(),
            calls_in_last_minute: stats.count,
            successful_calls: stats.success_count,
            failed_calls: stats.failure_count,
            avg_response_time: stats.avg_latency_ms,
        }
    }

    async fn record_attempt(&self, record: CallRecord) {
        self.usage.record(record.clone()).await;
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append_call_record(&record).await {
                warn!(error = %e, endpoint = %record.endpoint, "Failed to persist call record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthCheckResult;
    use crate::models::DataRecord;
    use crate::sink::{PoolStats, SqliteSink, TableFreshness};
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Transport that replays a fixed script of outcomes
    struct ScriptedTransport {
        script: Mutex<VecDeque<std::result::Result<Value, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<std::result::Result<Value, TransportError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _endpoint: &str,
            _params: &[(String, String)],
        ) -> std::result::Result<Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::network("script exhausted")))
        }
    }

    fn test_config() -> RateLimiterConfig {
        RateLimiterConfig {
            per_minute_cap: 100,
            per_second_cap: 10,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::status(500, "boom")),
            Err(TransportError::network("connection reset")),
            Ok(json!({"symbol": "AAPL"})),
        ]));
        let executor = RequestExecutor::new(test_config(), transport.clone());

        let payload = executor.execute("quote/AAPL", &[]).await.unwrap();
        assert_eq!(payload["symbol"], "AAPL");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        let records = executor.usage().recent(10).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records.iter().filter(|r| r.succeeded).count(), 1);
        assert_eq!(records.iter().filter(|r| !r.succeeded).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_uses_linear_backoff() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::status(500, "first")),
            Err(TransportError::status(502, "second")),
            Err(TransportError::status(503, "third")),
        ]));
        let executor = RequestExecutor::new(test_config(), transport);
        let start = Instant::now();

        let err = executor.execute("quote/AAPL", &[]).await.unwrap_err();
        match err {
            IngestError::ExhaustedRetries {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.status_code, Some(503));
            }
            other => panic!("unexpected error: {other}"),
        }

        // 1s after the first failure, 2s after the second, nothing after the last
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_secs(4));
        assert_eq!(executor.usage().len().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_attempt_waits_cooldown() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::rate_limited()),
            Ok(json!([])),
        ]));
        let executor = RequestExecutor::new(test_config(), transport);
        let start = Instant::now();

        executor.execute("historical/AAPL", &[]).await.unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(60));
        assert!(waited < Duration::from_secs(61));

        let records = executor.usage().recent(10).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status_code, Some(429));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_rate_limit_can_fail_fast() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(
            TransportError::rate_limited(),
        )]));
        let config = RateLimiterConfig {
            retry_attempts: 1,
            cooldown_on_final_attempt: false,
            ..test_config()
        };
        let executor = RequestExecutor::new(config, transport);
        let start = Instant::now();

        let err = executor.execute("quote/AAPL", &[]).await.unwrap_err();
        assert!(matches!(err, IngestError::ExhaustedRetries { attempts: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_reuse_the_granted_slot() {
        // A one-per-minute cap would stall every retry if each took a slot
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::status(500, "boom")),
            Ok(json!({})),
        ]));
        let config = RateLimiterConfig {
            per_minute_cap: 1,
            ..test_config()
        };
        let executor = RequestExecutor::new(config, transport);
        let start = Instant::now();

        executor.execute("quote/AAPL", &[]).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));

        let snapshot = executor.usage_snapshot().await;
        assert_eq!(snapshot.current_minute_calls, 1);
        assert_eq!(snapshot.remaining_calls_this_minute, 0);
        assert_eq!(snapshot.calls_in_last_minute, 2);
        assert_eq!(snapshot.successful_calls, 1);
        assert_eq!(snapshot.failed_calls, 1);
    }

    #[tokio::test]
    async fn test_attempts_are_mirrored_to_sink() {
        let sink = Arc::new(SqliteSink::in_memory().await.unwrap());
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::status(500, "boom")),
            Err(TransportError::status(500, "boom")),
            Ok(json!({})),
        ]));
        let executor = RequestExecutor::new(test_config(), transport).with_sink(sink.clone());

        executor.execute("quote/AAPL", &[]).await.unwrap();

        assert_eq!(sink.query_recent_error_count(1).await.unwrap(), 2);
    }

    /// Sink whose call-log writes for "slow" take two seconds
    struct SlowCallLogSink;

    #[async_trait]
    impl PersistenceSink for SlowCallLogSink {
        async fn upsert(&self, _record: &DataRecord) -> Result<()> {
            Ok(())
        }

        async fn append_health_result(&self, _result: &HealthCheckResult) -> Result<()> {
            Ok(())
        }

        async fn append_call_record(&self, record: &CallRecord) -> Result<()> {
            if record.endpoint == "slow" {
                sleep(Duration::from_secs(2)).await;
            }
            Ok(())
        }

        async fn prune_call_records(&self, _older_than: DateTime<Utc>) -> Result<u64> {
            Ok(0)
        }

        async fn query_freshness(&self) -> Result<Vec<TableFreshness>> {
            Ok(Vec::new())
        }

        async fn query_recent_error_count(&self, _window_hours: u32) -> Result<u64> {
            Ok(0)
        }

        async fn recent_health_results(&self, _limit: usize) -> Result<Vec<HealthCheckResult>> {
            Ok(Vec::new())
        }

        async fn ping(&self) -> Result<Duration> {
            Ok(Duration::ZERO)
        }

        fn pool_stats(&self) -> PoolStats {
            PoolStats::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_writes_keep_usage_window_accurate() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(json!({})), Ok(json!({}))]));
        let executor = Arc::new(
            RequestExecutor::new(test_config(), transport).with_sink(Arc::new(SlowCallLogSink)),
        );
        let start = Instant::now();

        let slow = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("slow", &[]).await }
        });
        sleep(Duration::from_secs(1)).await;
        let fast = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("fast", &[]).await }
        });
        slow.await.unwrap().unwrap();
        fast.await.unwrap().unwrap();

        tokio::time::sleep_until(start + Duration::from_millis(60_500)).await;
        let stats = executor.usage().stats_since(SNAPSHOT_WINDOW).await;
        assert_eq!(stats.count, 1);
        assert_eq!(executor.usage().recent(1).await[0].endpoint, "fast");
    }
}
