//! Orphaned blob cleanup.
//!
//! Deletes files under `UPLOAD_DIR` that no image record references and that
//! are older than `GC_GRACE_SECS`. Pass `--dry-run` to only report.
//!
//! Env vars reused from image-service: DATABASE_URL, UPLOAD_DIR, GC_GRACE_SECS.

use anyhow::Context;
use image_service::db::{ImageRepository, PgImageRepository};
use image_service::services::Reconciler;
use image_service::storage::BlobStore;
use image_service::{logging, startup, Config};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("failed to load configuration")?;
    logging::init_tracing(&config.logging);

    let dry_run = std::env::args().skip(1).any(|arg| arg == "--dry-run");

    let pool = startup::connect_database(&config.database).await?;
    let repo: Arc<dyn ImageRepository> = Arc::new(PgImageRepository::new(pool));
    let store = BlobStore::open(&config.storage.upload_dir)
        .await
        .context("failed to open upload directory")?;

    info!(
        upload_dir = %config.storage.upload_dir.display(),
        grace_secs = config.gc.grace_secs,
        dry_run,
        "Starting blob reconciliation"
    );

    let reconciler = Reconciler::new(repo, store, Duration::from_secs(config.gc.grace_secs));
    let report = reconciler.run(dry_run).await?;

    println!(
        "scanned={} referenced={} removed={} skipped_recent={} failed={}",
        report.scanned, report.referenced, report.removed, report.skipped_recent, report.failed
    );
    Ok(())
}
