//! Bounded log of recent upstream call outcomes
//!
//! Feeds statistics and health assessment only; quota decisions never read
//! from here. Entries older than the retention horizon are dropped by
//! [`UsageRecorder::prune`], which the daemon runs on its own cadence.

use crate::models::{CallRecord, UsageStats};
use crate::observability::{IngestMetrics, StructuredLogger};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default retention horizon (5 minutes)
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);

/// Hard ceiling on retained entries, regardless of age
pub const DEFAULT_MAX_ENTRIES: usize = 50_000;

/// In-memory call log shared by the executor and the health checks
pub struct UsageRecorder {
    records: RwLock<VecDeque<CallRecord>>,
    max_entries: usize,
    metrics: IngestMetrics,
}

impl Default for UsageRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl UsageRecorder {
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(max_entries.min(1_024))),
            max_entries: max_entries.max(1),
            metrics: IngestMetrics::new(),
        }
    }

    /// Append one call outcome, evicting the oldest entry at capacity
    pub async fn record(&self, record: CallRecord) {
        let mut records = self.records.write().await;
        while records.len() >= self.max_entries {
            records.pop_front();
        }
        records.push_back(record);
        self.metrics.set_usage_log_entries(records.len() as i64);
    }

    /// Statistics over records taken within the last `window`
    pub async fn stats_since(&self, window: Duration) -> UsageStats {
        let now = Instant::now();
        let records = self.records.read().await;

        let mut stats = UsageStats::default();
        let mut latency_total: u64 = 0;

        // Concurrent writers can append slightly out of timestamp order
        for record in records
            .iter()
            .filter(|r| now.saturating_duration_since(r.recorded_at) <= window)
        {
            stats.count += 1;
            if record.succeeded {
                stats.success_count += 1;
            } else {
                stats.failure_count += 1;
            }
            latency_total += record.latency_ms;
        }

        if stats.count > 0 {
            stats.avg_latency_ms = latency_total as f64 / stats.count as f64;
        }
        stats
    }

    /// Drop entries older than `retention`; returns how many were removed
    pub async fn prune(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().await;
        let before = records.len();

        records.retain(|r| now.saturating_duration_since(r.recorded_at) <= retention);

        let removed = before - records.len();
        self.metrics.set_usage_log_entries(records.len() as i64);
        if removed > 0 {
            debug!(removed = removed, remaining = records.len(), "Pruned usage log");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Most recent records, newest first
    pub async fn recent(&self, limit: usize) -> Vec<CallRecord> {
        let records = self.records.read().await;
        records.iter().rev().take(limit).cloned().collect()
    }

    /// Prune on a fixed cadence until `shutdown` is cancelled
    pub async fn run_pruning(
        self: Arc<Self>,
        every: Duration,
        retention: Duration,
        logger: StructuredLogger,
        shutdown: CancellationToken,
    ) {
        info!(
            interval_secs = every.as_secs(),
            retention_secs = retention.as_secs(),
            "Starting usage log pruning"
        );

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.prune(retention).await;
                    if removed > 0 {
                        logger.log_usage_pruned(removed, self.len().await);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Stopping usage log pruning");
                    break;
                }
            }
        }
    }
}
