//! Upload service - the producer side of the pipeline
//!
//! `submit` validates an upload, creates the record, stores the original,
//! publishes the job and flips the record to PROCESSING. If any step after
//! record creation fails, the record and the stored blob are removed again
//! so a failed upload leaves nothing behind.

use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::queue::JobQueue;
use crate::config::Config;
use crate::db::ImageRepository;
use crate::error::{AppError, Result};
use crate::models::{ImageRecord, ImageStatus, JobMessage};
use crate::storage::{extension_of, BlobStore};

/// Upload acceptance rules
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    pub max_file_size: usize,
    pub allowed_extensions: Vec<String>,
}

impl UploadPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_size: config.processing.max_file_size,
            allowed_extensions: config.processing.allowed_extensions.clone(),
        }
    }

    /// Require a filename whose extension is on the allow-list.
    pub fn check_filename(&self, filename: Option<&str>) -> Result<String> {
        let filename = filename
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::Validation("No filename provided".to_string()))?;

        let allowed = extension_of(filename)
            .map(|ext| self.allowed_extensions.iter().any(|a| *a == ext))
            .unwrap_or(false);
        if !allowed {
            return Err(AppError::Validation(format!(
                "Unsupported file type. Allowed: {}",
                self.allowed_extensions.join(", ")
            )));
        }
        Ok(filename.to_string())
    }

    pub fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_file_size {
            return Err(AppError::Validation(format!(
                "File size exceeds {} limit",
                human_size(self.max_file_size)
            )));
        }
        Ok(())
    }
}

fn human_size(bytes: usize) -> String {
    const MB: usize = 1024 * 1024;
    const KB: usize = 1024;
    if bytes >= MB && bytes % MB == 0 {
        format!("{}MB", bytes / MB)
    } else if bytes >= KB && bytes % KB == 0 {
        format!("{}KB", bytes / KB)
    } else {
        format!("{bytes} bytes")
    }
}

/// Accepted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub image_id: Uuid,
    pub status: ImageStatus,
}

pub struct UploadService {
    repo: Arc<dyn ImageRepository>,
    store: BlobStore,
    queue: Arc<dyn JobQueue>,
    policy: UploadPolicy,
    routing_key: String,
}

impl UploadService {
    pub fn new(
        repo: Arc<dyn ImageRepository>,
        store: BlobStore,
        queue: Arc<dyn JobQueue>,
        policy: UploadPolicy,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            store,
            queue,
            policy,
            routing_key: routing_key.into(),
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Accept an upload and queue it for processing.
    pub async fn submit(&self, filename: &str, bytes: &[u8]) -> Result<UploadReceipt> {
        let filename = self.policy.check_filename(Some(filename))?;
        self.policy.check_size(bytes.len())?;

        let record = self.repo.create(&filename).await?;
        let image_id = record.id;
        let mut stored_path: Option<String> = None;

        match self.enqueue(&record, bytes, &mut stored_path).await {
            Ok(()) => {
                info!(
                    image_id = %image_id,
                    filename = %filename,
                    size = bytes.len(),
                    "Image uploaded and queued"
                );
                Ok(UploadReceipt {
                    image_id,
                    status: ImageStatus::Processing,
                })
            }
            Err(e) => {
                error!(image_id = %image_id, error = %e, "Upload failed, rolling back");
                self.rollback(image_id, stored_path.as_deref()).await;
                Err(e)
            }
        }
    }

    async fn enqueue(
        &self,
        record: &ImageRecord,
        bytes: &[u8],
        stored_path: &mut Option<String>,
    ) -> Result<()> {
        let path = self.store.store(bytes, &record.original_filename).await?;
        *stored_path = Some(path.clone());

        self.repo.set_original_path(record.id, &path).await?;

        let message = JobMessage {
            image_id: record.id,
            original_path: path,
            original_filename: record.original_filename.clone(),
        };
        let message_id = self
            .queue
            .publish(&self.routing_key, &message.to_vec()?)
            .await
            .map_err(|e| AppError::Publish(e.to_string()))?;

        // The worker may already have moved past PROCESSING; that is fine.
        self.repo.mark_processing(record.id).await?;

        info!(image_id = %record.id, message_id = %message_id, "Job published");
        Ok(())
    }

    async fn rollback(&self, image_id: Uuid, stored_path: Option<&str>) {
        if let Some(path) = stored_path {
            if let Err(e) = self.store.delete(path).await {
                warn!(image_id = %image_id, path = %path, error = %e, "Failed to remove stored original");
            }
        }
        if let Err(e) = self.repo.delete(image_id).await {
            warn!(image_id = %image_id, error = %e, "Failed to remove image record");
        }
    }

    /// Current state of an image.
    pub async fn fetch(&self, image_id: Uuid) -> Result<ImageRecord> {
        self.repo
            .get(image_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Image not found".to_string()))
    }
}
