//! Audience Express: segment builder and scheduled audience export service.
//!
//! Main entry point that loads the dataset, wires the stores, connectors and
//! scheduler, and starts the server.

use audience_api::{ApiServer, AppState};
use audience_cdp::ConnectorRegistry;
use audience_core::config::{AppConfig, StoreBackend};
use audience_core::{Clock, SystemClock};
use audience_export::ExportJobRunner;
use audience_scheduler::{InMemoryScheduleStore, JsonScheduleStore, ScheduleStore, Scheduler};
use audience_segmentation::{
    Dataset, InMemorySegmentStore, SegmentStore, SegmentationEngine, YamlSegmentStore,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "audience-express")]
#[command(about = "Audience segment builder with scheduled exports")]
#[command(version)]
struct Cli {
    /// Dataset CSV path (overrides config)
    #[arg(long, env = "AUDIENCE_EXPRESS__DATASET__PATH")]
    dataset: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "AUDIENCE_EXPRESS__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Serve the API without running scheduled exports
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audience_express=info,audience_scheduler=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Audience Express starting up");

    // Load configuration
    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(path) = cli.dataset {
        config.dataset.path = path;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!(
        dataset = %config.dataset.path,
        http_port = config.api.http_port,
        store = ?config.store.backend,
        scheduler = config.scheduler.enabled && !cli.no_scheduler,
        "Configuration loaded"
    );

    // The dataset is the only hard requirement; without it there is no catalog.
    let dataset = Arc::new(Dataset::from_csv_path(&config.dataset.path, &config.dataset)?);
    info!(
        rows = dataset.len(),
        columns = dataset.columns().len(),
        "Dataset loaded"
    );

    let segments: Arc<dyn SegmentStore>;
    let schedules: Arc<dyn ScheduleStore>;
    match config.store.backend {
        StoreBackend::Memory => {
            segments = Arc::new(InMemorySegmentStore::new());
            schedules = Arc::new(InMemoryScheduleStore::new());
        }
        StoreBackend::File => {
            segments = Arc::new(YamlSegmentStore::open(&config.store.segments_dir)?);
            schedules = Arc::new(JsonScheduleStore::open(&config.store.schedules_path)?);
        }
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Arc::new(SegmentationEngine::new(
        dataset,
        segments,
        clock.clone(),
        &config.dataset,
        &config.query,
    )?);
    let registry = Arc::new(
        ConnectorRegistry::from_config(&config.connectors, &config.export.output_dir)?
            .with_clock(clock.clone()),
    );
    let runner = Arc::new(ExportJobRunner::new(
        engine.clone(),
        registry.clone(),
        clock.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        schedules,
        runner,
        clock,
        &config.scheduler,
    )?);

    let api_server = ApiServer::new(
        config.clone(),
        AppState {
            engine,
            scheduler: scheduler.clone(),
            registry,
            start_time: Instant::now(),
        },
    );

    // Start metrics exporter
    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics() {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    let scheduler_handle = if config.scheduler.enabled && !cli.no_scheduler {
        Some(scheduler.start())
    } else {
        info!("Scheduled exports disabled");
        None
    };

    info!("Audience Express is ready to serve traffic");

    // Serve until the listener fails or the process is interrupted.
    let served = tokio::select! {
        result = api_server.start_http() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    if let Some(handle) = scheduler_handle {
        handle.stop().await;
    }
    served
}
