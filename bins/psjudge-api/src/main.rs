mod handlers;
mod metrics;
mod routes;

use anyhow::Context;
use axum::Router;
use psjudge_common::config::{JudgeConfig, LogFormat};
use psjudge_common::queue::JobQueue;
use psjudge_common::redis::{RedisQueue, RedisStore};
use psjudge_common::store::JobStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutting down HTTP server");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = JudgeConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_format);

    info!("psjudge API booting...");

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, "Connected to Redis");

    // Leases only matter to consumers; the api only publishes
    let state = Arc::new(AppState {
        store: Arc::new(RedisStore::new(conn.clone(), &config.key_prefix)),
        queue: Arc::new(RedisQueue::new(
            conn,
            &config.key_prefix,
            config.visibility_timeout(),
        )),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&config.api_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_addr))?;

    info!(addr = %config.api_addr, "HTTP server listening");
    info!("Ready to accept builds");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}
