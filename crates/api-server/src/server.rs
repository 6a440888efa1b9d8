//! API server: HTTP router plus the Prometheus exporter.

use crate::analysis_rest;
use crate::bandit_rest;
use crate::experiments_rest;
use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use pisces_core::config::AppConfig;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Every route the service exposes, with middleware applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Traffic
        .route("/v1/traffic/assign", post(rest::handle_assign))
        .route(
            "/v1/traffic/experiments/:experiment_id/visitors/:visitor_id",
            get(rest::handle_visitor_group),
        )
        .route(
            "/v1/traffic/visitors/:visitor_id/experiments",
            get(rest::handle_visitor_experiments),
        )
        .route("/v1/events", post(rest::handle_event))
        // Bandit
        .route(
            "/v1/bandit/experiments/:experiment_id/reward",
            post(bandit_rest::handle_reward),
        )
        .route(
            "/v1/bandit/experiments/:experiment_id/beta",
            get(bandit_rest::handle_beta),
        )
        .route(
            "/v1/bandit/experiments/:experiment_id/stats",
            get(bandit_rest::handle_stats),
        )
        .route(
            "/v1/bandit/experiments/:experiment_id/arms",
            get(bandit_rest::handle_arms),
        )
        // Analysis
        .route(
            "/v1/analysis/experiments/:experiment_id/win-rate",
            get(analysis_rest::handle_win_rate),
        )
        .route(
            "/v1/analysis/experiments/:experiment_id/early-stop",
            get(analysis_rest::handle_early_stop),
        )
        .route(
            "/v1/analysis/experiments/:experiment_id/bayesian",
            get(analysis_rest::handle_bayesian),
        )
        // Experiment admin
        .route(
            "/v1/experiments/:experiment_id",
            get(experiments_rest::handle_get)
                .put(experiments_rest::handle_put)
                .delete(experiments_rest::handle_delete),
        )
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

    /// Start the metrics exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.metrics.port);
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
