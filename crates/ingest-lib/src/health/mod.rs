//! Health supervision for the ingestion pipeline
//!
//! This module provides:
//! - Check kinds, verdicts and the aggregate rule
//! - Host resource sampling
//! - The probe set run once per supervision cycle
//! - Per-kind alert suppression
//! - The periodic supervisor tying them together

mod alerter;
mod checks;
mod host;
mod supervisor;

pub use alerter::{
    AlertmanagerAlert, AlertmanagerPayload, Alerter, HealthAlert, DEFAULT_SUPPRESSION_WINDOW,
};
pub use checks::{
    ApiProbe, DatabaseProbe, DataFreshnessProbe, DiskSpaceProbe, ErrorRateProbe, HealthCheckSet,
    HealthProbe, MemoryProbe, RateLimitProbe,
};
pub use host::{DiskUsage, HostMetrics, HostMetricsSource, SysinfoHost};
pub use supervisor::{HealthSupervisor, SupervisorConfig, SupervisorState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The fixed set of probes run every cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Database,
    Api,
    DiskSpace,
    Memory,
    DataFreshness,
    RateLimit,
    ErrorRate,
}

impl CheckKind {
    pub const ALL: [CheckKind; 7] = [
        CheckKind::Database,
        CheckKind::Api,
        CheckKind::DiskSpace,
        CheckKind::Memory,
        CheckKind::DataFreshness,
        CheckKind::RateLimit,
        CheckKind::ErrorRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Database => "database",
            CheckKind::Api => "api",
            CheckKind::DiskSpace => "disk_space",
            CheckKind::Memory => "memory",
            CheckKind::DataFreshness => "data_freshness",
            CheckKind::RateLimit => "rate_limit",
            CheckKind::ErrorRate => "error_rate",
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown check kind: {}", s))
    }
}

/// Verdict of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    /// The probe could not run; excluded from the aggregate
    Unknown,
}

impl HealthStatus {
    /// Gauge encoding used by the metrics
    pub fn level(&self) -> i64 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
            HealthStatus::Unknown => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Grade `value` against ascending warning/critical limits (strictly above)
    pub fn from_thresholds(value: f64, warning: f64, critical: f64) -> Self {
        if value > critical {
            HealthStatus::Critical
        } else if value > warning {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "warning" => Ok(HealthStatus::Warning),
            "critical" => Ok(HealthStatus::Critical),
            "unknown" => Ok(HealthStatus::Unknown),
            other => Err(format!("unknown health status: {}", other)),
        }
    }
}

/// Aggregate verdict of one supervision cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Critical,
}

impl OverallStatus {
    pub fn level(&self) -> i64 {
        match self {
            OverallStatus::Healthy => 0,
            OverallStatus::Warning => 1,
            OverallStatus::Critical => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Warning => "warning",
            OverallStatus::Critical => "critical",
        }
    }

    /// Critical if any check is Critical, else Warning if any is Warning.
    /// Unknown results do not contribute.
    pub fn from_checks(checks: &[HealthCheckResult]) -> Self {
        let mut has_warning = false;

        for check in checks {
            match check.status {
                HealthStatus::Critical => return OverallStatus::Critical,
                HealthStatus::Warning => has_warning = true,
                HealthStatus::Healthy | HealthStatus::Unknown => {}
            }
        }

        if has_warning {
            OverallStatus::Warning
        } else {
            OverallStatus::Healthy
        }
    }
}

/// Result of one probe in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub check: CheckKind,
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn new(check: CheckKind, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            check,
            status,
            message: message.into(),
            details: Map::new(),
            latency_ms: 0,
            timestamp: Utc::now(),
        }
    }

    /// A probe that could not produce a verdict
    pub fn unknown(check: CheckKind, error: impl fmt::Display) -> Self {
        let error = error.to_string();
        Self::new(check, HealthStatus::Unknown, format!("Check failed: {}", error))
            .with_detail("error", error)
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

/// Latest cycle outcome served to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateHealth {
    pub overall: OverallStatus,
    pub checks: Vec<HealthCheckResult>,
    #[serde(rename = "metrics", skip_serializing_if = "Option::is_none", default)]
    pub host_metrics: Option<HostMetrics>,
    pub checked_at: DateTime<Utc>,
}

impl AggregateHealth {
    pub fn from_checks(checks: Vec<HealthCheckResult>, host_metrics: Option<HostMetrics>) -> Self {
        Self {
            overall: OverallStatus::from_checks(&checks),
            checks,
            host_metrics,
            checked_at: Utc::now(),
        }
    }

    pub fn check(&self, kind: CheckKind) -> Option<&HealthCheckResult> {
        self.checks.iter().find(|c| c.check == kind)
    }
}

/// Warning and critical limits for every probe
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
    pub freshness_warning_hours: f64,
    pub freshness_critical_hours: f64,
    pub rate_limit_warning_percent: f64,
    pub rate_limit_critical_percent: f64,
    pub error_warning_count: u64,
    pub error_critical_count: u64,
    /// Window of the error-rate probe
    pub error_window_hours: u32,
    /// Pool waiters above this make the database probe a Warning
    pub pool_waiting_warning: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            memory_warning_percent: 80.0,
            memory_critical_percent: 90.0,
            disk_warning_percent: 80.0,
            disk_critical_percent: 90.0,
            freshness_warning_hours: 24.0,
            freshness_critical_hours: 48.0,
            rate_limit_warning_percent: 70.0,
            rate_limit_critical_percent: 90.0,
            error_warning_count: 5,
            error_critical_count: 10,
            error_window_hours: 1,
            pool_waiting_warning: 5,
        }
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
