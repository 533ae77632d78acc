//! HTTP snapshot publisher for health, usage stats and Prometheus metrics

use crate::health::{HealthSupervisor, OverallStatus};
use crate::limiter::RequestExecutor;
use crate::observability::IngestMetrics;
use crate::sink::PersistenceSink;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<RequestExecutor>,
    pub supervisor: Arc<HealthSupervisor>,
    pub sink: Arc<dyn PersistenceSink>,
    pub metrics: IngestMetrics,
}

impl AppState {
    pub fn new(
        executor: Arc<RequestExecutor>,
        supervisor: Arc<HealthSupervisor>,
        sink: Arc<dyn PersistenceSink>,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            executor,
            supervisor,
            sink,
            metrics,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Latest aggregate health: 200 unless Critical, 503 before the first cycle
async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.supervisor.snapshot().await {
        Some(health) => {
            let status_code = match health.overall {
                OverallStatus::Healthy | OverallStatus::Warning => StatusCode::OK,
                OverallStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status_code, Json(health)).into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "overall": "unknown", "checks": [], "message": "No health cycle completed yet" })),
        )
            .into_response(),
    }
}

/// Readiness: 200 once a health cycle has completed
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.supervisor.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Point-in-time usage snapshot
async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.executor.usage_snapshot().await)
}

/// Persisted health results, newest first
async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    match state.sink.recent_health_results(limit).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to read health history");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stats", get(stats))
        .route("/health/history", get(history))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled
pub async fn serve(port: u16, state: Arc<AppState>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
