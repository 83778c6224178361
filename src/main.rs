mod api;
mod config;
mod markets;
mod monitoring;
mod storage;

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

use api::{create_router, AppState};
use config::{Config, EnvConfig};
use markets::MarketService;
use storage::MarketStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let env_config = EnvConfig::load()?;
    let file_exists = std::path::Path::new(&env_config.config_path).exists();
    let mut config = Config::load_or_default(&env_config.config_path)?;
    config.apply_env(&env_config);

    // Initialize tracing
    monitoring::logger::init(&config.logging)?;

    tracing::info!("Prediction Markets API starting...");
    if file_exists {
        tracing::info!("Loaded configuration from {}", env_config.config_path);
    } else {
        tracing::warn!("Config file {} not found, using defaults", env_config.config_path);
    }
    tracing::info!("Storage backend: {:?}", config.storage.backend);
    tracing::info!("Response envelope: {:?}", config.server.envelope);

    // Initialize storage; serving against an uninitialized store is not allowed
    let store = storage::open(&config.storage, env_config.database_url.as_deref())
        .context("Failed to open storage")?;
    store
        .initialize()
        .await
        .context("Failed to initialize storage")?;

    let service = MarketService::new(store);
    let count = service.count().await.context("Failed to read storage")?;
    tracing::info!("{} prediction markets available", count);

    let state = AppState::new(service, config.server.envelope);
    let app = create_router(state, Duration::from_secs(config.server.request_timeout_secs));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.server.host, config.server.port))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Server running on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
