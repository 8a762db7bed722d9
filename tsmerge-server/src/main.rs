//! TsMerge Server - administrative HTTP API for the merge engine

mod api;

use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tsmerge_core::{MergeConfig, MergeEngine};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Merge engine configuration
    pub merge: MergeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8087)),
            merge: MergeConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `TSMERGE_CONFIG` names a JSON merge configuration, `TSMERGE_HTTP_ADDR` the listen address
    fn from_env() -> anyhow::Result<Self> {
        let mut config = ServerConfig::default();
        if let Ok(path) = std::env::var("TSMERGE_CONFIG") {
            config.merge = MergeConfig::from_json_file(&PathBuf::from(path))?;
        }
        if let Ok(addr) = std::env::var("TSMERGE_HTTP_ADDR") {
            config.http_addr = addr.parse()?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = ServerConfig::from_env()?;

    info!("Starting TsMerge server...");
    info!("Data directory: {:?}", config.merge.data_dir);
    info!("HTTP server: http://{}", config.http_addr);

    let engine = MergeEngine::open(config.merge.clone(), tokio::runtime::Handle::current())?;
    engine.start();

    let app = api::create_router(engine.clone());

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("TsMerge server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}
