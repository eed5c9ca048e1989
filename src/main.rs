//! COVID-19 statistics service
//!
//! Keeps a table of daily cases and deaths for Germany up to date and serves
//! it over a small REST API.
//!
//! # Architecture
//!
//! - **Domain**: the table, its fields and the adapter traits
//! - **Application**: snapshot acquisition, upserts, window statistics, reads
//! - **Infrastructure**: RKI client, Parquet and JSON persistence
//! - **API**: HTTP handlers, routing, and middleware
//!
//! # Configuration
//!
//! Settings come from `config.yaml` (path overridable with `CONFIG_PATH`) and
//! the environment:
//! - `PORT`, `DATA_PATH`, `RKI_BASE_URL`: override the matching config values
//! - `RUST_LOG`: Logging level (default: info)
//! - `LOG_FORMAT=json`: structured log output
//!
//! # Quick Start
//!
//! ```bash
//! # Fetch the latest publication once and exit
//! cargo run --release -- --once
//!
//! # Null the configured known_outliers in the stored table and exit
//! cargo run --release -- --correct-outliers
//!
//! # Run the scheduler and the API server
//! cargo run --release
//! curl http://localhost:3010/v1/daily-figures
//! ```

use anyhow::Context;
use covid_stats::api::{create_router, AppState};
use covid_stats::application::{ConsistentSnapshotAcquirer, ReadApi, UpdateService, UpsertEngine};
use covid_stats::config::{Config, StorageBackend};
use covid_stats::domain::PersistenceAdapter;
use covid_stats::infrastructure::{JsonFileStore, ParquetStore, RkiClient};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter = EnvFilter::new(env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));

    if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let args: Vec<String> = env::args().skip(1).collect();
    let run_once = args.iter().any(|arg| arg == "--once");
    let correct_outliers = args.iter().any(|arg| arg == "--correct-outliers");

    // Load Config
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let mut config = Config::load(&config_path)?;
    config.apply_overrides(|name| env::var(name).ok());
    tracing::info!("covid-stats {} starting with config from {}", VERSION, config_path);

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    // Infrastructure
    let store: Arc<dyn PersistenceAdapter> = match config.storage.backend {
        StorageBackend::Parquet => Arc::new(ParquetStore::new(&config.storage.path)),
        StorageBackend::Json => Arc::new(JsonFileStore::new(&config.storage.path)),
    };
    tracing::info!(
        "Table storage: {:?} at {} (key {})",
        config.storage.backend,
        config.storage.path,
        config.storage.key
    );
    let source = Arc::new(RkiClient::new(&config.source).context("Failed to build RKI client")?);

    // Application
    let engine = Arc::new(UpsertEngine::new(
        store,
        config.storage.key.clone(),
        config.statistics.clone(),
    ));
    let days = engine
        .bootstrap()
        .await
        .with_context(|| format!("Failed to load table {}", config.storage.key))?;
    tracing::info!("Loaded {} days from storage", days);

    if correct_outliers {
        let outliers = config.outlier_cells();
        let table = engine
            .correct_outliers(&outliers)
            .await
            .context("Failed to correct outliers")?;
        tracing::info!("Nulled {} outlier cell(s) across {} days", outliers.len(), table.len());
        return Ok(());
    }

    let acquirer = ConsistentSnapshotAcquirer::new(source, config.snapshot.clone());
    let updater = Arc::new(UpdateService::new(acquirer, engine.clone(), config.outlier_cells()));

    if run_once {
        let report = updater.run().await.context("Update run failed")?;
        tracing::info!("{}", serde_json::to_string(&report)?);
        return Ok(());
    }

    let scheduler = tokio::spawn(schedule_updates(updater, config.schedule.clone()));

    let state = AppState {
        read_api: ReadApi::new(engine),
        metrics: metrics_handle,
    };
    let app = create_router(state, &config.server.allowed_origins);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to address {}", addr))?;
    tracing::info!("COVID-19 statistics API running at http://{}", addr);

    // Graceful shutdown handling
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error during operation")?;

    scheduler.abort();
    Ok(())
}

/// Run the update on a fixed interval. A failed run leaves the table as it
/// was and the next tick tries again.
async fn schedule_updates(updater: Arc<UpdateService>, schedule: covid_stats::config::ScheduleConfig) {
    let mut interval = tokio::time::interval(schedule.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // The first tick completes immediately.
    if !schedule.run_on_start {
        interval.tick().await;
    }
    loop {
        interval.tick().await;
        if let Err(e) = updater.run().await {
            tracing::debug!("Scheduled update skipped, retrying next tick: {}", e);
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C) to initiate graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
