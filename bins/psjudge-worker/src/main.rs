mod config;
mod dispatcher;
mod engine;
mod evaluator;
mod executor;
mod metrics;
mod pool;
mod process;
mod publisher;
mod reaper;
mod runner;
mod toolchain;

use anyhow::Context;
use config::LanguageConfigManager;
use dispatcher::Dispatcher;
use executor::BuildExecutor;
use pool::WorkerPool;
use psjudge_common::config::{JudgeConfig, LogFormat};
use psjudge_common::queue::JobQueue;
use psjudge_common::redis::{RedisQueue, RedisStore};
use psjudge_common::store::JobStore;
use publisher::StatusPublisher;
use reaper::Reaper;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use toolchain::ToolchainRegistry;
use tracing::{error, info, warn};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Warn when a live job could be mistaken for a crashed one. Running jobs
/// heartbeat, so only the queue lease has to fit inside the stale bound.
fn check_stale_bound(config: &JudgeConfig) {
    if config.stale_running() <= config.visibility_timeout() {
        warn!(
            stale_running_secs = config.stale_running_secs,
            visibility_timeout_secs = config.visibility_timeout_secs,
            "STALE_RUNNING_SECS should exceed VISIBILITY_TIMEOUT_SECS"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = JudgeConfig::from_env().context("Invalid configuration")?;
    init_tracing(config.log_format);

    info!("psjudge worker booting...");

    let languages = LanguageConfigManager::load(&config.languages_config).map_err(|e| {
        error!("Failed to load language configurations: {:#}", e);
        error!("Make sure {} exists", config.languages_config.display());
        e
    })?;
    info!(languages = ?languages.list_languages(), "Loaded language configurations");
    check_stale_bound(&config);

    let toolchains = ToolchainRegistry::from_config(&languages)?;
    info!(toolchains = ?toolchains.languages(), slots = config.worker_slots, "Toolchains ready");

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;
    info!(redis_url = %config.redis_url, prefix = %config.key_prefix, "Connected to Redis");

    let store: Arc<dyn JobStore> = Arc::new(RedisStore::new(conn.clone(), &config.key_prefix));
    let queue: Arc<dyn JobQueue> = Arc::new(RedisQueue::new(
        conn,
        &config.key_prefix,
        config.visibility_timeout(),
    ));

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.work_dir.display()))?;

    let pool = WorkerPool::new(config.worker_slots);
    let publisher = StatusPublisher::new(store.clone(), queue.clone());
    let executor = Arc::new(
        BuildExecutor::new(store.clone(), toolchains, publisher, config.work_dir.clone())
            .with_heartbeat_interval(config.heartbeat_interval()),
    );
    let dispatcher = Dispatcher::new(
        store.clone(),
        queue.clone(),
        pool,
        executor,
        config.queue_poll_interval(),
    );
    let reaper = Reaper::new(
        store,
        queue,
        config.stale_running(),
        config.reaper_interval(),
    );

    let listener = TcpListener::bind(&config.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.metrics_addr))?;
    info!(addr = %config.metrics_addr, "Metrics server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, metrics::router()).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { reaper.run(shutdown).await })
    };

    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Received shutdown signal, draining in-flight builds...");
        let _ = shutdown_tx.send(true);
    });

    dispatcher.run(shutdown_rx).await;
    if let Err(e) = reaper_task.await {
        error!(error = %e, "Reaper task failed");
    }

    info!("Worker shutdown complete");
    Ok(())
}
