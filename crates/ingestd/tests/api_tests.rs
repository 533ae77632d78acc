//! Integration tests for the snapshot publisher endpoints

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use ingest_lib::{
    health::{Alerter, CheckKind, HealthCheckSet, HealthProbe, HealthSupervisor, SupervisorConfig},
    limiter::{RateLimiterConfig, RequestExecutor, Transport},
    observability::IngestMetrics,
    publisher::{create_router, AppState},
    sink::{PersistenceSink, SqliteSink},
    HealthCheckResult, HealthStatus, TransportError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct OkTransport;

#[async_trait]
impl Transport for OkTransport {
    async fn send(
        &self,
        _endpoint: &str,
        _params: &[(String, String)],
    ) -> Result<Value, TransportError> {
        Ok(json!([{ "symbol": "AAPL", "price": 189.5 }]))
    }
}

struct FixedProbe {
    kind: CheckKind,
    status: HealthStatus,
}

#[async_trait]
impl HealthProbe for FixedProbe {
    fn kind(&self) -> CheckKind {
        self.kind
    }

    async fn check(&self) -> ingest_lib::Result<HealthCheckResult> {
        Ok(HealthCheckResult::new(self.kind, self.status, "fixed"))
    }
}

async fn setup_test_app(statuses: &[(CheckKind, HealthStatus)]) -> (Router, Arc<AppState>) {
    let sink: Arc<dyn PersistenceSink> = Arc::new(SqliteSink::in_memory().await.unwrap());

    let config = RateLimiterConfig {
        request_pacing: Duration::ZERO,
        ..Default::default()
    };
    let executor = Arc::new(RequestExecutor::new(config, Arc::new(OkTransport)).with_sink(sink.clone()));

    let checks = statuses.iter().fold(HealthCheckSet::new(), |set, (kind, status)| {
        set.with_probe(Arc::new(FixedProbe {
            kind: *kind,
            status: *status,
        }))
    });
    let supervisor = Arc::new(
        HealthSupervisor::new(SupervisorConfig::default(), checks, Arc::new(Alerter::default()))
            .with_sink(sink.clone()),
    );

    let state = Arc::new(AppState::new(executor, supervisor, sink, IngestMetrics::new()));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_503_before_first_cycle() {
    let (app, _state) = setup_test_app(&[(CheckKind::Database, HealthStatus::Healthy)]).await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["overall"], "unknown");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_warning() {
    let (app, state) = setup_test_app(&[
        (CheckKind::Database, HealthStatus::Healthy),
        (CheckKind::Memory, HealthStatus::Warning),
    ])
    .await;
    state.supervisor.run_cycle().await.unwrap();

    let (status, health) = get(app, "/healthz").await;

    // Warning is still operational
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["overall"], "warning");
    assert_eq!(health["checks"].as_array().unwrap().len(), 2);
    assert_eq!(health["checks"][1]["check"], "memory");
}

#[tokio::test]
async fn test_healthz_returns_503_when_critical() {
    let (app, state) = setup_test_app(&[
        (CheckKind::DiskSpace, HealthStatus::Critical),
        (CheckKind::Api, HealthStatus::Unknown),
    ])
    .await;
    state.supervisor.run_cycle().await.unwrap();

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["overall"], "critical");
}

#[tokio::test]
async fn test_readyz_follows_first_cycle() {
    let (app, state) = setup_test_app(&[(CheckKind::Database, HealthStatus::Healthy)]).await;

    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    state.supervisor.run_cycle().await.unwrap();

    let (status, readiness) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_stats_reports_usage_snapshot() {
    let (app, state) = setup_test_app(&[]).await;
    state.executor.execute("quote/AAPL", &[]).await.unwrap();

    let (status, stats) = get(app, "/stats").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["currentMinuteCalls"], 1);
    assert_eq!(stats["remainingCallsThisMinute"], 279);
    assert_eq!(stats["callsInLastMinute"], 1);
    assert_eq!(stats["successfulCalls"], 1);
    assert_eq!(stats["failedCalls"], 0);
}

#[tokio::test]
async fn test_history_honours_limit() {
    let (app, state) = setup_test_app(&[
        (CheckKind::Database, HealthStatus::Healthy),
        (CheckKind::ErrorRate, HealthStatus::Warning),
    ])
    .await;
    state.supervisor.run_cycle().await.unwrap();
    state.supervisor.run_cycle().await.unwrap();

    let (status, history) = get(app.clone(), "/health/history").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history.as_array().unwrap().len(), 4);

    let (_, history) = get(app, "/health/history?limit=3").await;
    assert_eq!(history.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app(&[(CheckKind::Memory, HealthStatus::Healthy)]).await;
    state.executor.execute("quote/AAPL", &[]).await.unwrap();
    state.supervisor.run_cycle().await.unwrap();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("ingest_upstream_requests_total"));
    assert!(metrics_text.contains("ingest_upstream_request_latency_seconds_bucket"));
    assert!(metrics_text.contains("ingest_health_overall_status"));
    assert!(metrics_text.contains("ingest_health_check_status"));
}
