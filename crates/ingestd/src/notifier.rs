//! Forwards emitted alerts to an Alertmanager-compatible webhook

use anyhow::{bail, Context, Result};
use ingest_lib::health::{AlertmanagerPayload, HealthAlert};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AlertForwarder {
    client: reqwest::Client,
    webhook_url: String,
    instance: String,
}

impl AlertForwarder {
    pub fn new(webhook_url: impl Into<String>, instance: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("failed to build webhook client")?;

        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
            instance: instance.into(),
        })
    }

    /// POST one alert to the webhook
    pub async fn forward(&self, alert: &HealthAlert) -> Result<()> {
        let payload = AlertmanagerPayload {
            alerts: vec![alert.to_alertmanager(&self.instance)],
        };

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("webhook request failed")?;

        if !response.status().is_success() {
            bail!("webhook returned HTTP {}", response.status().as_u16());
        }

        debug!(check = %alert.check, "Alert forwarded");
        Ok(())
    }

    /// Forward alerts from `alerts` until `shutdown` is cancelled
    pub async fn run(self, mut alerts: broadcast::Receiver<HealthAlert>, shutdown: CancellationToken) {
        info!("Starting alert forwarder");

        loop {
            tokio::select! {
                received = alerts.recv() => match received {
                    Ok(alert) => {
                        if let Err(e) = self.forward(&alert).await {
                            warn!(check = %alert.check, error = %e, "Failed to forward alert");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Alert forwarder lagged, alerts dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Alert forwarder stopped");
    }
}
