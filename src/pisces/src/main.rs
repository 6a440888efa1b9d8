//! Pisces: experiment traffic allocation, multi-armed bandits and Bayesian
//! early-stop analysis behind a JSON API.

use clap::{Parser, ValueEnum};
use pisces_api::{ApiServer, AppState, Stores};
use pisces_cache::{seed_from_json, RedisStore};
use pisces_core::config::{AppConfig, StorageBackend};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Memory,
    Redis,
}

impl From<Backend> for StorageBackend {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::Memory => StorageBackend::Memory,
            Backend::Redis => StorageBackend::Redis,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "pisces")]
#[command(about = "Experiment traffic allocation and Bayesian analysis service")]
#[command(version)]
struct Cli {
    /// Config file (TOML or JSON); environment variables override it
    #[arg(long, short, env = "PISCES_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "PISCES__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "PISCES__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Storage backend for experiments, assignments and counters
    #[arg(long, value_enum)]
    backend: Option<Backend>,
}

fn build_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match config.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory storage backend");
            if config.experiments.cache_ttl_ms > 0 {
                info!("Metadata cache skipped, the in-memory registry is authoritative");
            }
            Ok(Stores::in_memory())
        }
        StorageBackend::Redis => {
            let stores = Stores::redis(Arc::new(RedisStore::connect(&config.storage.redis)?));
            if config.experiments.cache_ttl_ms == 0 {
                return Ok(stores);
            }
            info!(
                ttl_ms = config.experiments.cache_ttl_ms,
                "Caching experiment metadata"
            );
            Ok(stores.with_metadata_cache(Duration::from_millis(
                config.experiments.cache_ttl_ms,
            )))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pisces=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Pisces starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(backend) = cli.backend {
        config.storage.backend = backend.into();
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    let stores = build_stores(&config)?;

    if let Some(path) = &config.experiments.seed_path {
        if let Err(e) = seed_from_json(stores.catalog.as_ref(), path) {
            error!(error = %e, path = %path, "Failed to seed experiment definitions");
        }
    }

    if let Some(cache) = stores.metadata_cache.clone() {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let evicted = cache.evict_expired();
                if evicted > 0 {
                    info!(evicted, "Expired experiment metadata evicted");
                }
            }
        });
    }

    let state = AppState::new(&config, stores);
    let api_server = ApiServer::new(config.clone(), state);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Pisces is ready to serve traffic");

    api_server.start_http().await?;

    Ok(())
}
