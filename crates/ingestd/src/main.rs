//! ingestd - rate-limited market data ingestion daemon
//!
//! Loads configured datasets through a quota-gated executor into SQLite,
//! supervises pipeline health and serves snapshots over HTTP.

use anyhow::{Context, Result};
use ingest_lib::{
    health::{
        Alerter, ApiProbe, DataFreshnessProbe, DatabaseProbe, DiskSpaceProbe, ErrorRateProbe,
        HealthCheckSet, HealthSupervisor, HealthThresholds, MemoryProbe, RateLimitProbe,
        SysinfoHost,
    },
    limiter::{HttpTransport, RequestExecutor, Transport, UsageRecorder},
    loader::{DatasetLoader, DatasetSpec},
    observability::{IngestMetrics, StructuredLogger},
    publisher::{self, AppState},
    sink::{run_call_log_pruning, PersistenceSink, SqliteSink},
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod notifier;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting ingestd");

    let config = config::DaemonConfig::load()?;
    info!(
        instance = %config.instance_name,
        datasets = config.datasets.len(),
        symbols = config.symbols.len(),
        "Daemon configured"
    );

    let metrics = IngestMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);
    let limiter = config.rate_limiter();
    logger.log_startup(DAEMON_VERSION, limiter.per_minute_cap, limiter.per_second_cap);

    let sqlite = Arc::new(
        open_database(&config.database_url)
            .await
            .with_context(|| format!("failed to open database {}", config.database_url))?,
    );
    let sink: Arc<dyn PersistenceSink> = sqlite.clone();

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.transport())?);
    let usage = Arc::new(UsageRecorder::default());
    let executor = Arc::new(
        RequestExecutor::new(limiter, transport.clone())
            .with_usage(usage.clone())
            .with_sink(sink.clone()),
    );

    // Health checks
    let thresholds = HealthThresholds::default();
    let host = Arc::new(SysinfoHost::new(&config.disk_path));
    let checks = HealthCheckSet::new()
        .with_probe(Arc::new(DatabaseProbe::new(sink.clone(), thresholds.clone())))
        .with_probe(Arc::new(ApiProbe::new(
            transport.clone(),
            executor.quota(),
            config.api_probe_endpoint.clone(),
        )))
        .with_probe(Arc::new(DiskSpaceProbe::new(host.clone(), thresholds.clone())))
        .with_probe(Arc::new(MemoryProbe::new(host.clone(), thresholds.clone())))
        .with_probe(Arc::new(DataFreshnessProbe::new(
            sink.clone(),
            config.freshness_targets(),
            thresholds.clone(),
        )))
        .with_probe(Arc::new(RateLimitProbe::new(executor.quota(), thresholds.clone())))
        .with_probe(Arc::new(ErrorRateProbe::new(sink.clone(), thresholds)));

    let alerter = Arc::new(Alerter::new(Duration::from_secs(config.alert_suppression_secs)));
    let supervisor = Arc::new(
        HealthSupervisor::new(config.supervisor(), checks, alerter)
            .with_host(host)
            .with_sink(sink.clone())
            .with_logger(logger.clone()),
    );

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    if let Some(url) = &config.alert_webhook_url {
        let forwarder = notifier::AlertForwarder::new(url.clone(), config.instance_name.clone())?;
        tasks.push(tokio::spawn(forwarder.run(supervisor.subscribe(), shutdown.clone())));
    }

    supervisor.start().await;

    tasks.push(tokio::spawn(usage.clone().run_pruning(
        Duration::from_secs(config.usage_prune_interval_secs.max(1)),
        Duration::from_secs(config.usage_retention_secs),
        logger.clone(),
        shutdown.clone(),
    )));

    tasks.push(tokio::spawn(run_call_log_pruning(
        sink.clone(),
        Duration::from_secs(config.usage_prune_interval_secs.max(1)),
        config.call_log_retention(),
        shutdown.clone(),
    )));

    let loader = DatasetLoader::new(executor.clone(), sink.clone())
        .with_batches(config.light_batch(), config.heavy_batch());
    tasks.push(tokio::spawn(run_loads(
        loader,
        config.datasets.clone(),
        config.symbols.clone(),
        Duration::from_secs(config.load_interval_secs),
        logger.clone(),
        shutdown.clone(),
    )));

    // Start health/stats/metrics server
    let app_state = Arc::new(AppState::new(executor, supervisor.clone(), sink, metrics));
    let api_handle = tokio::spawn(publisher::serve(config.api_port, app_state, shutdown.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            logger.log_shutdown("SIGINT received");
        }
        served = api_handle => {
            // The server only returns early when it could not bind or crashed
            match served {
                Ok(Ok(())) => logger.log_shutdown("API server stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "API server failed");
                    shutdown.cancel();
                    supervisor.stop().await;
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "API server task panicked");
                    logger.log_shutdown("API server task panicked");
                }
            }
        }
    }

    info!("Shutting down");
    shutdown.cancel();
    supervisor.stop().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    sqlite.close().await;

    Ok(())
}

/// Open a `sqlite:` URL, or treat anything else as a file path
async fn open_database(database_url: &str) -> ingest_lib::Result<SqliteSink> {
    if database_url.starts_with("sqlite:") {
        SqliteSink::open(database_url).await
    } else {
        SqliteSink::open_path(Path::new(database_url)).await
    }
}

/// Load every dataset now, then again every `every` unless it is zero
async fn run_loads(
    loader: DatasetLoader,
    datasets: Vec<DatasetSpec>,
    symbols: Vec<String>,
    every: Duration,
    logger: StructuredLogger,
    shutdown: CancellationToken,
) {
    if datasets.is_empty() || symbols.is_empty() {
        info!("No datasets or symbols configured, skipping loads");
        return;
    }

    loop {
        for spec in &datasets {
            if shutdown.is_cancelled() {
                return;
            }
            let summary = loader.load(spec, &symbols).await;
            logger.log_dataset_loaded(
                &summary.dataset,
                summary.succeeded,
                summary.failed,
                summary.records_written,
            );
            for (symbol, reason) in summary.failures() {
                warn!(dataset = %summary.dataset, symbol = %symbol, reason = %reason, "Load failure");
            }
        }

        if every.is_zero() {
            info!("One-shot load finished");
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
