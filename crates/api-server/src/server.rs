//! API server: HTTP routes and the Prometheus exporter.

use crate::rest::{self, AppState};
use audience_core::config::AppConfig;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Builds the application router over shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Segment building
        .route("/api/columns", get(rest::list_columns))
        .route("/api/evaluate-segment", post(rest::evaluate_segment))
        .route("/api/evaluate-query", post(rest::evaluate_query))
        // Segment storage
        .route("/api/save-segment", post(rest::save_segment))
        .route("/api/segments", get(rest::list_segments))
        .route("/api/segments/:name", delete(rest::delete_segment))
        // Exports
        .route("/api/schedule-export", post(rest::schedule_export))
        .route("/api/schedules", get(rest::list_schedules))
        .route("/api/schedules/:id", delete(rest::delete_schedule))
        .route("/api/export-now", post(rest::export_now))
        .route("/api/destinations", get(rest::list_destinations))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Start the HTTP REST server. Runs until the listener fails.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics exporter on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
