//! Dataset loading: fetch per symbol, extract records, upsert
//!
//! Payloads stay opaque; a [`DatasetSpec`] only says where the record array
//! lives and which field, if any, carries the record date.

use crate::batch::{BatchConfig, BatchOrchestrator};
use crate::limiter::RequestExecutor;
use crate::models::{DataRecord, ItemOutcome, NaturalKey};
use crate::observability::IngestMetrics;
use crate::sink::PersistenceSink;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYMBOL_PLACEHOLDER: &str = "{symbol}";

/// Where and how to fetch one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    /// Endpoint path; `{symbol}` is replaced per item
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// JSON pointer to the record array inside the payload
    #[serde(default)]
    pub items_pointer: Option<String>,
    /// Field holding a `YYYY-MM-DD` date, making the key symbol + date
    #[serde(default)]
    pub date_field: Option<String>,
    /// Uses the small batch size
    #[serde(default)]
    pub heavy: bool,
}

impl DatasetSpec {
    pub fn endpoint_for(&self, symbol: &str) -> String {
        self.endpoint.replace(SYMBOL_PLACEHOLDER, symbol)
    }

    fn query_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Split a payload into records keyed by symbol, or symbol + date
    pub fn extract_records(
        &self,
        symbol: &str,
        payload: Value,
    ) -> std::result::Result<Vec<DataRecord>, String> {
        let target = match &self.items_pointer {
            Some(pointer) => match payload.pointer(pointer) {
                Some(value) => value.clone(),
                None => return Err(format!("payload has no {}", pointer)),
            },
            None => payload,
        };

        match target {
            Value::Array(items) if self.date_field.is_none() && items.len() > 1 => Err(format!(
                "{} records would share the key {}; set date_field",
                items.len(),
                symbol
            )),
            Value::Array(items) => {
                let mut records = Vec::with_capacity(items.len());
                for item in items {
                    match self.key_for(symbol, &item) {
                        Some(key) => records.push(self.record(key, item)),
                        None => debug!(dataset = %self.name, symbol = %symbol, "Skipping item without a usable date"),
                    }
                }
                Ok(records)
            }
            Value::Object(_) => {
                let key = self
                    .key_for(symbol, &target)
                    .unwrap_or_else(|| NaturalKey::symbol(symbol));
                Ok(vec![self.record(key, target)])
            }
            other => Err(format!("unexpected payload type: {}", json_type(&other))),
        }
    }

    fn key_for(&self, symbol: &str, item: &Value) -> Option<NaturalKey> {
        let Some(field) = &self.date_field else {
            return Some(NaturalKey::symbol(symbol));
        };

        let raw = item.get(field)?.as_str()?;
        // Timestamps like "2024-03-01 16:00:00" keep only the date part
        let date = NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()?;
        Some(NaturalKey::dated(symbol, date))
    }

    fn record(&self, key: NaturalKey, payload: Value) -> DataRecord {
        DataRecord {
            dataset: self.name.clone(),
            key,
            payload,
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outcome of loading one dataset across a symbol list
#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub dataset: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub records_written: usize,
    /// One entry per symbol in input order; successes carry records written
    pub outcomes: Vec<ItemOutcome<usize>>,
}

impl LoadSummary {
    fn from_outcomes(dataset: &str, outcomes: Vec<ItemOutcome<usize>>) -> Self {
        let mut summary = Self {
            dataset: dataset.to_string(),
            total: outcomes.len(),
            succeeded: 0,
            failed: 0,
            records_written: 0,
            outcomes: Vec::new(),
        };
        for outcome in &outcomes {
            match outcome {
                ItemOutcome::Succeeded { value, .. } => {
                    summary.succeeded += 1;
                    summary.records_written += value;
                }
                ItemOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary.outcomes = outcomes;
        summary
    }

    /// Failed symbols with their reasons
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            ItemOutcome::Failed { key, reason } => Some((key.as_str(), reason.as_str())),
            ItemOutcome::Succeeded { .. } => None,
        })
    }
}

/// Loads datasets through the shared executor into the sink
pub struct DatasetLoader {
    executor: Arc<RequestExecutor>,
    sink: Arc<dyn PersistenceSink>,
    light: BatchOrchestrator,
    heavy: BatchOrchestrator,
    metrics: IngestMetrics,
}

impl DatasetLoader {
    pub fn new(executor: Arc<RequestExecutor>, sink: Arc<dyn PersistenceSink>) -> Self {
        let light = BatchConfig {
            batch_size: executor.config().batch_size,
            ..BatchConfig::light()
        };
        Self {
            executor,
            sink,
            light: BatchOrchestrator::new(light),
            heavy: BatchOrchestrator::new(BatchConfig::heavy()),
            metrics: IngestMetrics::new(),
        }
    }

    /// Override the batch settings for light and heavy datasets
    pub fn with_batches(mut self, light: BatchConfig, heavy: BatchConfig) -> Self {
        self.light = BatchOrchestrator::new(light);
        self.heavy = BatchOrchestrator::new(heavy);
        self
    }

    /// Load `spec` for every symbol; per-symbol failures land in the summary
    pub async fn load(&self, spec: &DatasetSpec, symbols: &[String]) -> LoadSummary {
        let orchestrator = if spec.heavy { &self.heavy } else { &self.light };
        info!(
            dataset = %spec.name,
            symbols = symbols.len(),
            batch_size = orchestrator.config().batch_size,
            "Loading dataset"
        );

        let outcomes = orchestrator
            .run(symbols.to_vec(), |symbol| self.load_symbol(spec, symbol))
            .await;

        LoadSummary::from_outcomes(&spec.name, outcomes)
    }

    async fn load_symbol(&self, spec: &DatasetSpec, symbol: String) -> ItemOutcome<usize> {
        let outcome = self.fetch_and_store(spec, &symbol).await;
        match &outcome {
            ItemOutcome::Succeeded { value, .. } => {
                self.metrics.inc_batch_item("succeeded");
                debug!(dataset = %spec.name, symbol = %symbol, records = value, "Symbol loaded");
            }
            ItemOutcome::Failed { reason, .. } => {
                self.metrics.inc_batch_item("failed");
                warn!(dataset = %spec.name, symbol = %symbol, reason = %reason, "Symbol failed");
            }
        }
        outcome
    }

    async fn fetch_and_store(&self, spec: &DatasetSpec, symbol: &str) -> ItemOutcome<usize> {
        let endpoint = spec.endpoint_for(symbol);
        let payload = match self.executor.execute(&endpoint, &spec.query_params()).await {
            Ok(payload) => payload,
            Err(e) => return ItemOutcome::failed(symbol, e.to_string()),
        };

        let records = match spec.extract_records(symbol, payload) {
            Ok(records) => records,
            Err(reason) => return ItemOutcome::failed(symbol, reason),
        };

        for record in &records {
            if let Err(e) = self.sink.upsert(record).await {
                return ItemOutcome::failed(symbol, e.to_string());
            }
        }
        ItemOutcome::succeeded(symbol, records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::limiter::{RateLimiterConfig, Transport};
    use crate::sink::SqliteSink;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Answers each endpoint with a fixed response
    struct StaticTransport {
        responses: HashMap<String, std::result::Result<Value, TransportError>>,
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn send(
            &self,
            endpoint: &str,
            _params: &[(String, String)],
        ) -> std::result::Result<Value, TransportError> {
            self.responses
                .get(endpoint)
                .cloned()
                .unwrap_or_else(|| Err(TransportError::status(404, "not found")))
        }
    }

    fn history_spec() -> DatasetSpec {
        DatasetSpec {
            name: "daily_prices".to_string(),
            endpoint: "historical-price-full/{symbol}".to_string(),
            params: BTreeMap::new(),
            items_pointer: Some("/historical".to_string()),
            date_field: Some("date".to_string()),
            heavy: true,
        }
    }

    #[test]
    fn test_endpoint_substitution() {
        assert_eq!(
            history_spec().endpoint_for("AAPL"),
            "historical-price-full/AAPL"
        );
    }

    #[test]
    fn test_extract_dated_records() {
        let payload = json!({
            "symbol": "AAPL",
            "historical": [
                {"date": "2024-03-01", "close": 179.66},
                {"date": "2024-02-29 16:00:00", "close": 180.75},
                {"close": 1.0}
            ]
        });

        let records = history_spec().extract_records("AAPL", payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].key,
            NaturalKey::dated("AAPL", NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(records[0].payload["close"], 179.66);
    }

    #[test]
    fn test_extract_object_keyed_by_symbol() {
        let spec = DatasetSpec {
            name: "profiles".to_string(),
            endpoint: "profile/{symbol}".to_string(),
            params: BTreeMap::new(),
            items_pointer: None,
            date_field: None,
            heavy: false,
        };

        let records = spec
            .extract_records("MSFT", json!({"companyName": "Microsoft"}))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, NaturalKey::symbol("MSFT"));

        assert!(spec.extract_records("MSFT", json!("oops")).is_err());
        assert!(history_spec().extract_records("MSFT", json!({})).is_err());
    }

    #[test]
    fn test_undated_array_with_many_items_is_rejected() {
        let spec = DatasetSpec {
            name: "quotes".to_string(),
            endpoint: "quote/{symbol}".to_string(),
            params: BTreeMap::new(),
            items_pointer: None,
            date_field: None,
            heavy: false,
        };

        let single = spec
            .extract_records("AAPL", json!([{"symbol": "AAPL", "price": 190.0}]))
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].key, NaturalKey::symbol("AAPL"));

        let err = spec
            .extract_records("AAPL", json!([{"price": 1.0}, {"price": 2.0}]))
            .unwrap_err();
        assert!(err.contains("share the key AAPL"));

        assert!(spec.extract_records("AAPL", json!([])).unwrap().is_empty());
    }

    #[test]
    fn test_spec_deserializes_with_defaults() {
        let spec: DatasetSpec = serde_json::from_value(json!({
            "name": "quotes",
            "endpoint": "quote/{symbol}"
        }))
        .unwrap();
        assert!(spec.params.is_empty());
        assert!(!spec.heavy);
        assert!(spec.date_field.is_none());
    }

    #[tokio::test]
    async fn test_load_reports_failures_without_aborting() {
        let mut responses = HashMap::new();
        responses.insert(
            "historical-price-full/AAPL".to_string(),
            Ok(json!({"historical": [
                {"date": "2024-03-01", "close": 1.0},
                {"date": "2024-03-04", "close": 2.0}
            ]})),
        );
        responses.insert(
            "historical-price-full/TSLA".to_string(),
            Err(TransportError::status(500, "upstream down")),
        );
        responses.insert(
            "historical-price-full/MSFT".to_string(),
            Ok(json!({"historical": [{"date": "2024-03-01", "close": 3.0}]})),
        );

        let config = RateLimiterConfig {
            retry_attempts: 2,
            retry_base_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let executor = Arc::new(RequestExecutor::new(
            config,
            Arc::new(StaticTransport { responses }),
        ));
        let sink = Arc::new(SqliteSink::in_memory().await.unwrap());
        let loader = DatasetLoader::new(executor, sink.clone());

        let symbols: Vec<String> = ["AAPL", "TSLA", "MSFT"].iter().map(|s| s.to_string()).collect();
        let summary = loader.load(&history_spec(), &symbols).await;

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.records_written, 3);
        assert_eq!(summary.outcomes[1].key(), "TSLA");

        let failures: Vec<_> = summary.failures().collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].1.contains("HTTP 500"));

        assert_eq!(sink.record_count("daily_prices").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reload_does_not_duplicate_rows() {
        let mut responses = HashMap::new();
        responses.insert(
            "quote/AAPL".to_string(),
            Ok(json!([{"symbol": "AAPL", "price": 190.0}])),
        );
        let executor = Arc::new(RequestExecutor::new(
            RateLimiterConfig::default(),
            Arc::new(StaticTransport { responses }),
        ));
        let sink = Arc::new(SqliteSink::in_memory().await.unwrap());
        let loader = DatasetLoader::new(executor, sink.clone());
        let spec = DatasetSpec {
            name: "quotes".to_string(),
            endpoint: "quote/{symbol}".to_string(),
            params: BTreeMap::new(),
            items_pointer: None,
            date_field: None,
            heavy: false,
        };

        let symbols = vec!["AAPL".to_string()];
        loader.load(&spec, &symbols).await;
        loader.load(&spec, &symbols).await;

        assert_eq!(sink.record_count("quotes").await.unwrap(), 1);
    }
}
