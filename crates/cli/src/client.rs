//! API client for the ingestion daemon's snapshot endpoints

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// API client for the daemon
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get_accepting(path, &[]).await
    }

    /// GET that also decodes bodies sent with one of `extra_ok` statuses
    async fn get_accepting<T: DeserializeOwned>(&self, path: &str, extra_ok: &[StatusCode]) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() && !extra_ok.contains(&status) {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn stats(&self) -> Result<UsageSnapshot> {
        self.get("stats").await
    }

    /// Latest health; a Critical report arrives as 503 and is still returned
    pub async fn health(&self) -> Result<HealthReport> {
        self.get_accepting("healthz", &[StatusCode::SERVICE_UNAVAILABLE])
            .await
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<CheckResult>> {
        self.get(&format!("health/history?limit={}", limit)).await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub current_minute_calls: u32,
    pub remaining_calls_this_minute: u32,
    pub calls_in_last_minute: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub avg_response_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: String,
    #[serde(default)]
    pub checks: Vec<CheckResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HostMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
    /// Set when no cycle has completed yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: String,
    pub status: String,
    pub message: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    #[serde(default)]
    pub latency_ms: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMetrics {
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_used_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}
