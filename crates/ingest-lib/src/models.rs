//! Core data models shared across the pipeline

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Outcome of one upstream attempt
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub succeeded: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Monotonic time the record was taken, used for windowing
    #[serde(skip)]
    pub recorded_at: Instant,
}

impl CallRecord {
    pub fn success(endpoint: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            endpoint: endpoint.into(),
            succeeded: true,
            latency_ms,
            status_code: None,
            recorded_at: Instant::now(),
        }
    }

    pub fn failure(endpoint: impl Into<String>, latency_ms: u64, status_code: Option<u16>) -> Self {
        Self {
            timestamp: Utc::now(),
            endpoint: endpoint.into(),
            succeeded: false,
            latency_ms,
            status_code,
            recorded_at: Instant::now(),
        }
    }
}

/// Aggregated call statistics over a trailing window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub avg_latency_ms: f64,
}

/// Point-in-time usage view served to the dashboard and CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub current_minute_calls: u32,
    pub remaining_calls_this_minute: u32,
    pub calls_in_last_minute: usize,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub avg_response_time: f64,
}

/// Natural key of a persisted record: symbol alone, or symbol + date
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

impl NaturalKey {
    pub fn symbol(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            date: None,
        }
    }

    pub fn dated(symbol: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            date: Some(date),
        }
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.date {
            Some(date) => write!(f, "{}@{}", self.symbol, date),
            None => write!(f, "{}", self.symbol),
        }
    }
}

/// An opaque upstream payload tagged with its dataset and natural key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    pub dataset: String,
    pub key: NaturalKey,
    pub payload: serde_json::Value,
}

/// Per-item result of a batch run; failures carry a reason instead of an error
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome<T> {
    Succeeded { key: String, value: T },
    Failed { key: String, reason: String },
}

impl<T> ItemOutcome<T> {
    pub fn succeeded(key: impl Into<String>, value: T) -> Self {
        ItemOutcome::Succeeded {
            key: key.into(),
            value,
        }
    }

    pub fn failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ItemOutcome::Failed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ItemOutcome::Succeeded { key, .. } | ItemOutcome::Failed { key, .. } => key,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded { .. })
    }
}
