/// Image Service - HTTP Server
///
/// Serves the upload and status API. With `WORKER_EMBEDDED=true` it also runs
/// a queue consumer in-process, which is required for the `memory://` queue.
use actix_cors::Cors;
use actix_web::{middleware as actix_middleware, web, App, HttpServer};
use anyhow::{bail, Context};
use image_service::db::{ImageRepository, PgImageRepository};
use image_service::services::{JobProcessor, ProcessorConfig};
use image_service::storage::BlobStore;
use image_service::{handlers, logging, startup, AppState, Config};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("failed to load configuration")?;
    logging::init_tracing(&config.logging);

    info!(
        env = %config.app.env,
        version = %config.app.version,
        upload_dir = %config.storage.upload_dir.display(),
        "Image service starting"
    );

    if config.queue.is_in_memory() && !config.worker.embedded {
        bail!("QUEUE_URL=memory:// requires WORKER_EMBEDDED=true");
    }

    let pool = startup::connect_database(&config.database).await?;
    let repo: Arc<dyn ImageRepository> = Arc::new(PgImageRepository::new(pool));
    let store = BlobStore::open(&config.storage.upload_dir)
        .await
        .context("failed to open upload directory")?;
    let queue = startup::connect_queue(&config.queue).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = if config.worker.embedded {
        info!(prefetch = config.worker.prefetch, "Starting embedded worker");
        let processor = Arc::new(JobProcessor::new(
            repo.clone(),
            store.clone(),
            ProcessorConfig::from(&config),
        ));
        Some(startup::spawn_worker(
            queue.clone(),
            processor,
            config.worker.prefetch,
            shutdown_rx,
        ))
    } else {
        None
    };

    let state = AppState::new(&config, repo, store, queue.clone());
    let bind_address = (config.app.host.clone(), config.app.port);
    info!(host = %bind_address.0, port = bind_address.1, "Starting HTTP server");

    // actix installs its own SIGINT/SIGTERM handling and returns once drained
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Cors::permissive())
            .wrap(actix_middleware::Logger::default())
            .configure(handlers::configure)
    })
    .bind(bind_address)?
    .run()
    .await?;

    let _ = shutdown_tx.send(true);
    if let Some(worker) = worker {
        match worker.await {
            Ok(Some(stats)) => info!(acked = stats.acked, dead_lettered = stats.dead_lettered, "Embedded worker stopped"),
            Ok(None) => warn!("Embedded worker stopped with error"),
            Err(e) => warn!(error = %e, "Embedded worker task failed"),
        }
    }

    queue.disconnect().await;
    info!("Image service shut down");
    Ok(())
}
