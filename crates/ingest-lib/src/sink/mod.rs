//! Persistence sink for ingested records, health history and the call log

mod sqlite;

pub use sqlite::SqliteSink;

use crate::error::Result;
use crate::health::HealthCheckResult;
use crate::models::{CallRecord, DataRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Last write time of one tracked dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFreshness {
    pub table: String,
    pub last_write: Option<DateTime<Utc>>,
    pub row_count: u64,
}

impl TableFreshness {
    /// Hours elapsed since the last write, `None` when nothing was written
    pub fn hours_since_write(&self, now: DateTime<Utc>) -> Option<f64> {
        self.last_write
            .map(|at| (now - at).num_seconds().max(0) as f64 / 3600.0)
    }
}

/// Connection pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    /// Callers currently queued for a connection
    pub waiting: u32,
}

/// Store the pipeline writes into and the health probes read from
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Insert or overwrite by natural key; applying a record twice is a no-op
    /// apart from the updated timestamp
    async fn upsert(&self, record: &DataRecord) -> Result<()>;

    async fn append_health_result(&self, result: &HealthCheckResult) -> Result<()>;

    async fn append_call_record(&self, record: &CallRecord) -> Result<()>;

    /// Delete call records taken before `older_than`; returns the rows removed
    async fn prune_call_records(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Last write per dataset that has rows
    async fn query_freshness(&self) -> Result<Vec<TableFreshness>>;

    /// Failed upstream calls within the last `window_hours`
    async fn query_recent_error_count(&self, window_hours: u32) -> Result<u64>;

    /// Most recent health results, newest first
    async fn recent_health_results(&self, limit: usize) -> Result<Vec<HealthCheckResult>>;

    /// Round-trip a trivial query, returning its latency
    async fn ping(&self) -> Result<Duration>;

    fn pool_stats(&self) -> PoolStats;
}

/// Trim the persisted call log on a fixed cadence until `shutdown` is cancelled
pub async fn run_call_log_pruning(
    sink: Arc<dyn PersistenceSink>,
    every: Duration,
    retention: Duration,
    shutdown: CancellationToken,
) {
    info!(
        interval_secs = every.as_secs(),
        retention_secs = retention.as_secs(),
        "Starting call log pruning"
    );

    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cutoff = Utc::now()
                    .checked_sub_signed(retention)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                match sink.prune_call_records(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed = removed, "Pruned persisted call log"),
                    Err(e) => warn!(error = %e, "Failed to prune persisted call log"),
                }
            }
            _ = shutdown.cancelled() => {
                info!("Stopping call log pruning");
                break;
            }
        }
    }
}
