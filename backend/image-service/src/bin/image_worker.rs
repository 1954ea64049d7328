//! Image Worker
//!
//! Standalone consumer for the `image_processing` queue. Each job produces
//! the configured thumbnails and a recompressed original, then marks the
//! image DONE (or ERROR).
//!
//! SIGINT/SIGTERM stop fetching; jobs already in flight finish and are
//! settled before the process exits.
//!
//! ## Environment Variables
//!
//! - `DATABASE_URL`: Postgres holding the `images` table
//! - `QUEUE_URL`: Redis URL (`memory://` is rejected, it cannot be shared)
//! - `UPLOAD_DIR`: Blob store root shared with the API (default: ./uploads)
//! - `THUMBNAIL_SIZES`: Bounds to generate (default: 100x100,300x300,1200x1200)
//! - `COMPRESS_QUALITY` / `THUMBNAIL_QUALITY`: JPEG quality (default: 85)
//! - `WORKER_PREFETCH`: Jobs processed concurrently (default: 1)
//! - `RECORD_RETRY_MAX` / `RECORD_RETRY_BACKOFF_MS`: Record-store retries

use anyhow::{bail, Context};
use image_service::db::{ImageRepository, PgImageRepository};
use image_service::services::queue::Consumer;
use image_service::services::{JobProcessor, ProcessorConfig};
use image_service::storage::BlobStore;
use image_service::{logging, startup, Config};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("failed to load configuration")?;
    logging::init_tracing(&config.logging);

    info!("Starting Image Worker");
    info!(
        queue = %config.queue.routing_key,
        group = %config.queue.group,
        consumer = %config.queue.consumer,
        prefetch = config.worker.prefetch,
        sizes = ?config.processing.thumbnail_sizes,
        "Configuration loaded"
    );

    if config.queue.is_in_memory() {
        bail!("the standalone worker needs a shared broker; use WORKER_EMBEDDED=true for memory://");
    }

    let pool = startup::connect_database(&config.database).await?;
    let repo: Arc<dyn ImageRepository> = Arc::new(PgImageRepository::new(pool));
    let store = BlobStore::open(&config.storage.upload_dir)
        .await
        .context("failed to open upload directory")?;
    let queue = startup::connect_queue(&config.queue).await?;

    let processor = Arc::new(JobProcessor::new(
        repo,
        store,
        ProcessorConfig::from(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    startup::spawn_signal_listener(shutdown_tx);

    let mut consumer = Consumer::new(queue.clone(), config.worker.prefetch, shutdown_rx);
    let stats = consumer.run(processor).await?;

    queue.disconnect().await;
    info!(
        received = stats.received,
        acked = stats.acked,
        dead_lettered = stats.dead_lettered,
        "Image Worker stopped"
    );
    Ok(())
}
