//! reqwest-backed transport for the upstream market data API

use super::Transport;
use crate::error::{IngestError, Result, TransportError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Longest response body excerpt carried in a `TransportError`
const MAX_ERROR_BODY: usize = 200;

/// Configuration for the HTTP transport
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL every endpoint is resolved against
    pub base_url: String,
    /// Sent as the `apikey` query parameter; never logged
    pub api_key: String,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "https://financialmodelingprep.com/api/v3".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for the upstream API
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IngestError::config(format!("failed to build HTTP client: {}", e)))?;

        // A trailing slash keeps the last path segment when joining
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|e| IngestError::config(format!("invalid API base URL: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
        })
    }

    fn endpoint_url(&self, endpoint: &str) -> std::result::Result<Url, TransportError> {
        self.base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| TransportError::network(format!("invalid endpoint {}: {}", endpoint, e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> std::result::Result<Value, TransportError> {
        let url = self.endpoint_url(endpoint)?;
        debug!(endpoint = %endpoint, params = params.len(), "Sending upstream request");

        let response = self
            .client
            .get(url)
            .query(params)
            .query(&[("apikey", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| TransportError::network(e.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body.chars().take(MAX_ERROR_BODY).collect()
            };
            return Err(TransportError::status(status.as_u16(), message));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::network(format!("invalid response body: {}", e.without_url())))
    }
}
