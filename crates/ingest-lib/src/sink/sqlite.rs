//! SQLite persistence via sqlx

use super::{PersistenceSink, PoolStats, TableFreshness};
use crate::error::{IngestError, Result};
use crate::health::{CheckKind, HealthCheckResult, HealthStatus};
use crate::models::{CallRecord, DataRecord, NaturalKey};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// A persisted record with its bookkeeping timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: DataRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrements the waiter count however the acquire ends
struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// SQLite-backed [`PersistenceSink`]
pub struct SqliteSink {
    pool: SqlitePool,
    waiting: AtomicUsize,
}

impl SqliteSink {
    /// Connect to a `sqlite:` URL and create the tables
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        info!(database_url = %database_url, "Connecting to database");
        Self::connect(options, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open a database file, creating its parent directory if needed
    pub async fn open_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IngestError::persistence(format!(
                    "failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        info!(path = %path.display(), "Opening database file");
        Self::connect(options, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Private in-memory database on a single long-lived connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let sink = Self {
            pool,
            waiting: AtomicUsize::new(0),
        };
        sink.run_migrations().await?;
        Ok(sink)
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        let sink = Self {
            pool,
            waiting: AtomicUsize::new(0),
        };
        sink.run_migrations().await?;
        Ok(sink)
    }

    async fn run_migrations(&self) -> Result<()> {
        debug!("Running database migrations");
        let mut conn = self.connection().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dataset TEXT NOT NULL,
                symbol TEXT NOT NULL,
                date TEXT NOT NULL DEFAULT '',
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(dataset, symbol, date)
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_dataset_updated ON records(dataset, updated_at)",
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS health_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                check_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                latency_ms INTEGER NOT NULL,
                checked_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                endpoint TEXT NOT NULL,
                succeeded INTEGER NOT NULL,
                latency_ms INTEGER NOT NULL,
                status_code INTEGER,
                called_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_calls_called_at ON api_calls(called_at)")
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Acquire a pooled connection, counting the caller as a waiter meanwhile
    async fn connection(&self) -> Result<PoolConnection<Sqlite>> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _guard = WaitGuard(&self.waiting);
        Ok(self.pool.acquire().await?)
    }

    /// Fetch one record by dataset and natural key
    pub async fn get_record(&self, dataset: &str, key: &NaturalKey) -> Result<Option<StoredRecord>> {
        let mut conn = self.connection().await?;
        let row = sqlx::query(
            r#"
            SELECT symbol, date, payload, created_at, updated_at
            FROM records
            WHERE dataset = ? AND symbol = ? AND date = ?
            "#,
        )
        .bind(dataset)
        .bind(&key.symbol)
        .bind(date_column(key))
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let date: String = row.try_get("date")?;
        let date = if date.is_empty() {
            None
        } else {
            Some(
                NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .map_err(|e| IngestError::persistence(format!("bad stored date {}: {}", date, e)))?,
            )
        };
        let payload: String = row.try_get("payload")?;

        Ok(Some(StoredRecord {
            record: DataRecord {
                dataset: dataset.to_string(),
                key: NaturalKey {
                    symbol: row.try_get("symbol")?,
                    date,
                },
                payload: serde_json::from_str(&payload)?,
            },
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        }))
    }

    /// Number of rows stored for `dataset`
    pub async fn record_count(&self, dataset: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE dataset = ?")
            .bind(dataset)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Rows currently held in the call log
    pub async fn call_record_count(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_calls")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PersistenceSink for SqliteSink {
    async fn upsert(&self, record: &DataRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        let now = Utc::now().timestamp_millis();

        let mut conn = self.connection().await?;
        sqlx::query(
            r#"
            INSERT INTO records (dataset, symbol, date, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(dataset, symbol, date) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.dataset)
        .bind(&record.key.symbol)
        .bind(date_column(&record.key))
        .bind(&payload)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn append_health_result(&self, result: &HealthCheckResult) -> Result<()> {
        let details = serde_json::to_string(&result.details)?;

        let mut conn = self.connection().await?;
        sqlx::query(
            r#"
            INSERT INTO health_checks (check_kind, status, message, details, latency_ms, checked_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.check.as_str())
        .bind(result.status.as_str())
        .bind(&result.message)
        .bind(&details)
        .bind(result.latency_ms as i64)
        .bind(result.timestamp.timestamp_millis())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn append_call_record(&self, record: &CallRecord) -> Result<()> {
        let mut conn = self.connection().await?;
        sqlx::query(
            r#"
            INSERT INTO api_calls (endpoint, succeeded, latency_ms, status_code, called_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.endpoint)
        .bind(record.succeeded)
        .bind(record.latency_ms as i64)
        .bind(record.status_code.map(i64::from))
        .bind(record.timestamp.timestamp_millis())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn prune_call_records(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.connection().await?;
        let result = sqlx::query("DELETE FROM api_calls WHERE called_at < ?")
            .bind(older_than.timestamp_millis())
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected())
    }

    async fn query_freshness(&self) -> Result<Vec<TableFreshness>> {
        let mut conn = self.connection().await?;
        let rows = sqlx::query(
            r#"
            SELECT dataset, MAX(updated_at) AS last_write, COUNT(*) AS row_count
            FROM records
            GROUP BY dataset
            ORDER BY dataset
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<TableFreshness> {
                let last_write: Option<i64> = row.try_get("last_write")?;
                let row_count: i64 = row.try_get("row_count")?;
                Ok(TableFreshness {
                    table: row.try_get("dataset")?,
                    last_write: last_write.map(from_millis).transpose()?,
                    row_count: row_count.max(0) as u64,
                })
            })
            .collect()
    }

    async fn query_recent_error_count(&self, window_hours: u32) -> Result<u64> {
        let since = (Utc::now() - ChronoDuration::hours(i64::from(window_hours))).timestamp_millis();

        let mut conn = self.connection().await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM api_calls WHERE succeeded = 0 AND called_at >= ?",
        )
        .bind(since)
        .fetch_one(&mut *conn)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn recent_health_results(&self, limit: usize) -> Result<Vec<HealthCheckResult>> {
        let mut conn = self.connection().await?;
        let rows = sqlx::query(
            r#"
            SELECT check_kind, status, message, details, latency_ms, checked_at
            FROM health_checks
            ORDER BY checked_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<HealthCheckResult> {
                let check: String = row.try_get("check_kind")?;
                let status: String = row.try_get("status")?;
                let details: String = row.try_get("details")?;
                let latency_ms: i64 = row.try_get("latency_ms")?;

                Ok(HealthCheckResult {
                    check: check.parse::<CheckKind>().map_err(IngestError::persistence)?,
                    status: status.parse::<HealthStatus>().map_err(IngestError::persistence)?,
                    message: row.try_get("message")?,
                    details: serde_json::from_str::<Map<String, Value>>(&details)?,
                    latency_ms: latency_ms.max(0) as u64,
                    timestamp: from_millis(row.try_get("checked_at")?)?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let mut conn = self.connection().await?;
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        Ok(started.elapsed())
    }

    fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            waiting: self.waiting.load(Ordering::SeqCst) as u32,
        }
    }
}

/// Undated keys store an empty date so the unique constraint still applies
fn date_column(key: &NaturalKey) -> String {
    key.date.map(|d| d.to_string()).unwrap_or_default()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| IngestError::persistence(format!("timestamp out of range: {}", ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quote(symbol: &str, price: f64) -> DataRecord {
        DataRecord {
            dataset: "quotes".to_string(),
            key: NaturalKey::symbol(symbol),
            payload: json!({ "symbol": symbol, "price": price }),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_by_natural_key() {
        let sink = SqliteSink::in_memory().await.unwrap();

        sink.upsert(&quote("AAPL", 190.0)).await.unwrap();
        let first = sink
            .get_record("quotes", &NaturalKey::symbol("AAPL"))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        sink.upsert(&quote("AAPL", 190.0)).await.unwrap();
        let second = sink
            .get_record("quotes", &NaturalKey::symbol("AAPL"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sink.record_count("quotes").await.unwrap(), 1);
        assert_eq!(first.record, second.record);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_payload() {
        let sink = SqliteSink::in_memory().await.unwrap();

        sink.upsert(&quote("MSFT", 400.0)).await.unwrap();
        sink.upsert(&quote("MSFT", 410.5)).await.unwrap();

        let stored = sink
            .get_record("quotes", &NaturalKey::symbol("MSFT"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record.payload["price"], 410.5);
        assert_eq!(sink.record_count("quotes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dated_keys_are_distinct() {
        let sink = SqliteSink::in_memory().await.unwrap();
        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        for date in [day1, day2] {
            sink.upsert(&DataRecord {
                dataset: "prices".to_string(),
                key: NaturalKey::dated("AAPL", date),
                payload: json!({ "close": 1.0 }),
            })
            .await
            .unwrap();
        }

        assert_eq!(sink.record_count("prices").await.unwrap(), 2);
        let stored = sink
            .get_record("prices", &NaturalKey::dated("AAPL", day2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.record.key.date, Some(day2));
        assert!(sink
            .get_record("prices", &NaturalKey::symbol("AAPL"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_freshness_per_dataset() {
        let sink = SqliteSink::in_memory().await.unwrap();
        sink.upsert(&quote("AAPL", 1.0)).await.unwrap();
        sink.upsert(&quote("MSFT", 2.0)).await.unwrap();
        sink.upsert(&DataRecord {
            dataset: "profiles".to_string(),
            key: NaturalKey::symbol("AAPL"),
            payload: json!({}),
        })
        .await
        .unwrap();

        let freshness = sink.query_freshness().await.unwrap();
        assert_eq!(freshness.len(), 2);
        assert_eq!(freshness[0].table, "profiles");
        assert_eq!(freshness[1].table, "quotes");
        assert_eq!(freshness[1].row_count, 2);

        let hours = freshness[1].hours_since_write(Utc::now()).unwrap();
        assert!(hours < 0.1);
    }

    #[tokio::test]
    async fn test_error_count_respects_window() {
        let sink = SqliteSink::in_memory().await.unwrap();

        let mut stale = CallRecord::failure("quote/AAPL", 10, Some(500));
        stale.timestamp = Utc::now() - ChronoDuration::hours(2);
        sink.append_call_record(&stale).await.unwrap();

        sink.append_call_record(&CallRecord::failure("quote/AAPL", 10, None))
            .await
            .unwrap();
        sink.append_call_record(&CallRecord::failure("quote/MSFT", 10, Some(429)))
            .await
            .unwrap();
        sink.append_call_record(&CallRecord::success("quote/MSFT", 10))
            .await
            .unwrap();

        assert_eq!(sink.query_recent_error_count(1).await.unwrap(), 2);
        assert_eq!(sink.query_recent_error_count(3).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_health_history_newest_first() {
        let sink = SqliteSink::in_memory().await.unwrap();

        let mut older = HealthCheckResult::new(CheckKind::Memory, HealthStatus::Warning, "85% used")
            .with_detail("used_percent", 85.0)
            .with_latency(3);
        older.timestamp = Utc::now() - ChronoDuration::minutes(1);
        let newer = HealthCheckResult::new(CheckKind::Database, HealthStatus::Healthy, "ok");

        sink.append_health_result(&older).await.unwrap();
        sink.append_health_result(&newer).await.unwrap();

        let history = sink.recent_health_results(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].check, CheckKind::Database);
        assert_eq!(history[1].status, HealthStatus::Warning);
        assert_eq!(history[1].details["used_percent"], 85.0);
        assert_eq!(history[1].latency_ms, 3);

        assert_eq!(sink.recent_health_results(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_and_pool_stats() {
        let sink = SqliteSink::in_memory().await.unwrap();
        sink.ping().await.unwrap();

        let stats = sink.pool_stats();
        assert_eq!(stats.waiting, 0);
        assert!(stats.size >= 1);
    }

    #[tokio::test]
    async fn test_open_path_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ingest.db");

        let sink = SqliteSink::open_path(&path).await.unwrap();
        sink.upsert(&quote("AAPL", 1.0)).await.unwrap();
        sink.close().await;
        assert!(path.exists());

        let reopened = SqliteSink::open_path(&path).await.unwrap();
        assert_eq!(reopened.record_count("quotes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_call_records_removes_only_old_rows() {
        let sink = SqliteSink::in_memory().await.unwrap();

        let mut old = CallRecord::failure("quote/AAPL", 20, Some(500));
        old.timestamp = Utc::now() - ChronoDuration::hours(48);
        sink.append_call_record(&old).await.unwrap();
        sink.append_call_record(&CallRecord::failure("quote/MSFT", 20, Some(502)))
            .await
            .unwrap();
        sink.append_call_record(&CallRecord::success("quote/TSLA", 20))
            .await
            .unwrap();

        let removed = sink
            .prune_call_records(Utc::now() - ChronoDuration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(sink.call_record_count().await.unwrap(), 2);
        assert_eq!(sink.query_recent_error_count(1).await.unwrap(), 1);

        let removed_again = sink
            .prune_call_records(Utc::now() - ChronoDuration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed_again, 0);
    }
}
