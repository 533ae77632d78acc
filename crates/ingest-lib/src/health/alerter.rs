//! Alert emission for Critical health results
//!
//! Handles:
//! - Per-check-kind suppression within a configurable window
//! - Fan-out of emitted alerts to subscribers
//! - Formatting alerts for an Alertmanager webhook

use super::{CheckKind, HealthCheckResult, HealthStatus};
use crate::observability::IngestMetrics;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// Default suppression window (1 hour)
pub const DEFAULT_SUPPRESSION_WINDOW: Duration = Duration::from_secs(60 * 60);

const CHANNEL_CAPACITY: usize = 64;

/// An alert raised for a Critical result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub check: CheckKind,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl HealthAlert {
    fn from_result(result: &HealthCheckResult) -> Self {
        Self {
            check: result.check,
            message: result.message.clone(),
            details: result.details.clone(),
            timestamp: result.timestamp,
        }
    }

    /// Alertmanager representation, labelled with the emitting instance
    pub fn to_alertmanager(&self, instance: &str) -> AlertmanagerAlert {
        let mut labels = HashMap::new();
        labels.insert("alertname".to_string(), "IngestHealthCritical".to_string());
        labels.insert("severity".to_string(), "critical".to_string());
        labels.insert("check".to_string(), self.check.to_string());
        labels.insert("instance".to_string(), instance.to_string());

        let mut annotations = HashMap::new();
        annotations.insert(
            "summary".to_string(),
            format!("Health check {} is critical", self.check),
        );
        annotations.insert("description".to_string(), self.message.clone());
        if !self.details.is_empty() {
            annotations.insert(
                "details".to_string(),
                Value::Object(self.details.clone()).to_string(),
            );
        }

        AlertmanagerAlert {
            status: "firing".to_string(),
            labels,
            annotations,
            starts_at: self.timestamp.to_rfc3339(),
            ends_at: None,
            generator_url: None,
        }
    }
}

/// Alertmanager webhook alert format
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// Alert status (firing or resolved)
    pub status: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// Start time in RFC3339 format
    pub starts_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
}

/// Alertmanager webhook payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertmanagerPayload {
    pub alerts: Vec<AlertmanagerAlert>,
}

/// Alert emitter with per-kind suppression
pub struct Alerter {
    suppression_window: Duration,
    /// Check kind -> last emission time
    last_alert: DashMap<CheckKind, Instant>,
    sender: broadcast::Sender<HealthAlert>,
    metrics: IngestMetrics,
}

impl Default for Alerter {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPRESSION_WINDOW)
    }
}

impl Alerter {
    pub fn new(suppression_window: Duration) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            suppression_window,
            last_alert: DashMap::new(),
            sender,
            metrics: IngestMetrics::new(),
        }
    }

    pub fn suppression_window(&self) -> Duration {
        self.suppression_window
    }

    /// Receive every alert emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<HealthAlert> {
        self.sender.subscribe()
    }

    /// Whether an alert for `kind` would currently be suppressed
    pub fn should_suppress(&self, kind: CheckKind) -> bool {
        self.last_alert
            .get(&kind)
            .map(|last| last.elapsed() < self.suppression_window)
            .unwrap_or(false)
    }

    /// Emit an alert for a Critical result unless its kind alerted within
    /// the suppression window
    pub fn evaluate(&self, result: &HealthCheckResult) -> Option<HealthAlert> {
        if result.status != HealthStatus::Critical {
            return None;
        }

        let now = Instant::now();
        // Check and record under the same entry lock
        match self.last_alert.entry(result.check) {
            Entry::Occupied(mut last) => {
                if now.saturating_duration_since(*last.get()) < self.suppression_window {
                    self.metrics.inc_alert_suppressed();
                    debug!(check = %result.check, "Alert suppressed");
                    return None;
                }
                last.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }

        let alert = HealthAlert::from_result(result);
        self.metrics.inc_alert_emitted(result.check.as_str());
        // No subscribers is not an error
        let _ = self.sender.send(alert.clone());
        Some(alert)
    }

    /// Evaluate every result of one cycle
    pub fn process(&self, results: &[HealthCheckResult]) -> Vec<HealthAlert> {
        results.iter().filter_map(|r| self.evaluate(r)).collect()
    }
}
