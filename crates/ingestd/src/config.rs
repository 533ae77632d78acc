//! Daemon configuration

use anyhow::{bail, Context, Result};
use ingest_lib::batch::BatchConfig;
use ingest_lib::health::{HealthThresholds, SupervisorConfig};
use ingest_lib::limiter::{HttpTransportConfig, RateLimiterConfig};
use ingest_lib::loader::DatasetSpec;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "ingestd.toml";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Upstream API key
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Instance label for logs and alerts
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health/stats/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// `sqlite:` URL or a plain database file path
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_per_minute_cap")]
    pub per_minute_cap: u32,

    #[serde(default = "default_per_second_cap")]
    pub per_second_cap: u32,

    /// Advertised upstream plan limits; when both are set the caps are
    /// derived from them instead of `per_minute_cap`/`per_second_cap`
    #[serde(default)]
    pub plan_per_minute: Option<u32>,

    #[serde(default)]
    pub plan_per_second: Option<u32>,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_request_pacing_ms")]
    pub request_pacing_ms: u64,

    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,

    /// Chunk size for light datasets
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Chunk size for heavy datasets
    #[serde(default = "default_heavy_batch_size")]
    pub heavy_batch_size: usize,

    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,

    #[serde(default = "default_supervision_interval_secs")]
    pub supervision_interval_secs: u64,

    #[serde(default = "default_usage_retention_secs")]
    pub usage_retention_secs: u64,

    #[serde(default = "default_usage_prune_interval_secs")]
    pub usage_prune_interval_secs: u64,

    /// How long persisted call records are kept
    #[serde(default = "default_call_log_retention_hours")]
    pub call_log_retention_hours: u32,

    #[serde(default = "default_alert_suppression_secs")]
    pub alert_suppression_secs: u64,

    /// Path whose disk the disk-space probe watches
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,

    /// Endpoint the API probe calls
    #[serde(default = "default_api_probe_endpoint")]
    pub api_probe_endpoint: String,

    /// Datasets the freshness probe watches; defaults to every configured dataset
    #[serde(default)]
    pub tracked_datasets: Vec<String>,

    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,

    /// Seconds between dataset loads; 0 loads once at startup
    #[serde(default)]
    pub load_interval_secs: u64,

    /// Alertmanager-compatible webhook for Critical alerts
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

fn default_api_base_url() -> String {
    "https://financialmodelingprep.com/api/v3".to_string()
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "ingestd".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite:ingest.db?mode=rwc".to_string()
}

fn default_per_minute_cap() -> u32 {
    280
}

fn default_per_second_cap() -> u32 {
    9
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_request_pacing_ms() -> u64 {
    50
}

fn default_rate_limit_cooldown_secs() -> u64 {
    60
}

fn default_batch_size() -> usize {
    10
}

fn default_heavy_batch_size() -> usize {
    3
}

fn default_inter_batch_delay_ms() -> u64 {
    1000
}

fn default_supervision_interval_secs() -> u64 {
    60
}

fn default_usage_retention_secs() -> u64 {
    300
}

fn default_usage_prune_interval_secs() -> u64 {
    60
}

fn default_call_log_retention_hours() -> u32 {
    24
}

fn default_alert_suppression_secs() -> u64 {
    3600
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}

fn default_api_probe_endpoint() -> String {
    "quote/AAPL".to_string()
}

impl DaemonConfig {
    /// Load from `ingestd.toml` (or `$INGESTD_CONFIG`) and `INGEST_*` variables
    pub fn load() -> Result<Self> {
        let path = std::env::var("INGESTD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        let config = config::Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Toml).required(false))
            .add_source(Self::environment())
            .build()
            .with_context(|| format!("failed to read configuration ({})", path))?;

        let config: Self = config
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("INGEST")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("symbols")
            .with_list_parse_key("tracked_datasets")
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            bail!("api_key is required (set INGEST_API_KEY)");
        }
        if self.per_minute_cap == 0 || self.per_second_cap == 0 {
            bail!("per_minute_cap and per_second_cap must be greater than zero");
        }
        match (self.plan_per_minute, self.plan_per_second) {
            (Some(0), _) | (_, Some(0)) => bail!("plan limits must be greater than zero"),
            (Some(_), None) | (None, Some(_)) => {
                bail!("plan_per_minute and plan_per_second must be set together")
            }
            _ => {}
        }
        let error_window = HealthThresholds::default().error_window_hours;
        if self.call_log_retention_hours < error_window {
            bail!(
                "call_log_retention_hours must cover the {}h error-rate window",
                error_window
            );
        }
        if self.batch_size == 0 || self.heavy_batch_size == 0 {
            bail!("batch_size and heavy_batch_size must be greater than zero");
        }
        if self.retry_attempts == 0 {
            bail!("retry_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn rate_limiter(&self) -> RateLimiterConfig {
        let caps = match (self.plan_per_minute, self.plan_per_second) {
            (Some(per_minute), Some(per_second)) => RateLimiterConfig::for_plan(per_minute, per_second),
            _ => RateLimiterConfig {
                per_minute_cap: self.per_minute_cap,
                per_second_cap: self.per_second_cap,
                ..Default::default()
            },
        };

        RateLimiterConfig {
            batch_size: self.batch_size,
            retry_attempts: self.retry_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            request_pacing: Duration::from_millis(self.request_pacing_ms),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
            ..caps
        }
    }

    pub fn call_log_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.call_log_retention_hours) * 3600)
    }

    pub fn transport(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            ..Default::default()
        }
    }

    pub fn light_batch(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
        }
    }

    pub fn heavy_batch(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.heavy_batch_size,
            inter_batch_delay: Duration::from_millis(self.inter_batch_delay_ms),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            interval: Duration::from_secs(self.supervision_interval_secs.max(1)),
        }
    }

    /// Datasets watched by the freshness probe
    pub fn freshness_targets(&self) -> Vec<String> {
        if self.tracked_datasets.is_empty() {
            self.datasets.iter().map(|d| d.name.clone()).collect()
        } else {
            self.tracked_datasets.clone()
        }
    }
}
