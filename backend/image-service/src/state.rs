/// Shared application state handed to every HTTP handler
use std::sync::Arc;

use crate::config::Config;
use crate::db::ImageRepository;
use crate::services::queue::JobQueue;
use crate::services::upload::{UploadPolicy, UploadService};
use crate::storage::BlobStore;

#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadService>,
    pub repo: Arc<dyn ImageRepository>,
    pub queue: Arc<dyn JobQueue>,
    pub version: String,
}

impl AppState {
    pub fn new(
        config: &Config,
        repo: Arc<dyn ImageRepository>,
        store: BlobStore,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let uploads = UploadService::new(
            repo.clone(),
            store,
            queue.clone(),
            UploadPolicy::from_config(config),
            config.queue.routing_key.clone(),
        );
        Self {
            uploads: Arc::new(uploads),
            repo,
            queue,
            version: config.app.version.clone(),
        }
    }
}
