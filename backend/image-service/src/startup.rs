/// Process wiring shared by the API, worker and GC binaries
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{DatabaseConfig, QueueConfig};
use crate::services::queue::{
    Consumer, ConsumerStats, InMemoryQueue, JobQueue, RedisQueueConfig, RedisStreamQueue,
};
use crate::services::JobProcessor;

/// Connect to Postgres and apply pending migrations.
pub async fn connect_database(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    info!(max_connections = config.max_connections, "Database connected");
    Ok(pool)
}

/// Build the queue named by `QUEUE_URL`.
pub async fn connect_queue(config: &QueueConfig) -> Result<Arc<dyn JobQueue>> {
    if config.is_in_memory() {
        info!(routing_key = %config.routing_key, "Using in-memory queue");
        return Ok(Arc::new(InMemoryQueue::new(config.routing_key.clone())));
    }

    let queue = RedisStreamQueue::connect(RedisQueueConfig {
        url: config.url.clone(),
        routing_key: config.routing_key.clone(),
        group: config.group.clone(),
        consumer: config.consumer.clone(),
        block_ms: config.block_ms,
        claim_idle_ms: config.claim_idle_ms,
        require_aof: config.require_aof,
        aof_timeout_ms: config.aof_timeout_ms,
    })
    .await
    .context("failed to connect to queue broker")?;

    Ok(Arc::new(queue))
}

/// Flip `shutdown_tx` on SIGINT or SIGTERM.
pub fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run a consumer for `processor` on its own task until shutdown.
pub fn spawn_worker(
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    prefetch: usize,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<Option<ConsumerStats>> {
    tokio::spawn(async move {
        let mut consumer = Consumer::new(queue, prefetch, shutdown_rx);
        match consumer.run(processor).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!(error = %e, "Worker stopped with error");
                None
            }
        }
    })
}
