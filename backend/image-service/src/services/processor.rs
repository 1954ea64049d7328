//! Job processor - drives one image through the worker-side pipeline
//!
//! For each job message:
//! 1. Parse the payload (unparseable → dropped)
//! 2. Load the record (missing or already terminal → dropped)
//! 3. Move the record to PROCESSING
//! 4. Generate thumbnails for every configured size
//! 5. Recompress the original and delete the uncompressed file
//! 6. Write DONE with the thumbnail manifest in a single update
//!
//! A redelivered job whose original was already replaced by its compressed
//! copy resumes from that copy instead of failing.
//!
//! A failure in steps 4-6 records ERROR with the message and surfaces as
//! `ProcessError::Pipeline`. Record-store calls are retried on transient
//! errors only.

use async_trait::async_trait;
use resilience::{retry_if, RetryConfig, RetryError};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::{Delivery, DeliveryHandler, Settlement};
use super::transform::{compressed_path, ImageTransformer};
use crate::config::Config;
use crate::db::{ImageRepository, RepoError};
use crate::error::AppError;
use crate::models::{CompletedImage, JobMessage, ThumbnailSize};
use crate::storage::BlobStore;

/// Job processor configuration
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub thumbnail_sizes: Vec<ThumbnailSize>,
    pub thumbnail_quality: u8,
    pub compress_quality: u8,
    /// Applied to record-store calls only
    pub retry: RetryConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            thumbnail_sizes: vec![
                ThumbnailSize::new(100, 100),
                ThumbnailSize::new(300, 300),
                ThumbnailSize::new(1200, 1200),
            ],
            thumbnail_quality: 85,
            compress_quality: 85,
            retry: RetryConfig::default(),
        }
    }
}

impl From<&Config> for ProcessorConfig {
    fn from(config: &Config) -> Self {
        Self {
            thumbnail_sizes: config.processing.thumbnail_sizes.clone(),
            thumbnail_quality: config.processing.thumbnail_quality,
            compress_quality: config.processing.compress_quality,
            retry: config.worker.retry_policy(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Completed { image_id: Uuid },
    /// Nothing to do; the message is settled without touching any record
    Dropped { reason: String },
}

fn dropped(reason: AppError) -> HandleOutcome {
    HandleOutcome::Dropped {
        reason: reason.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("record store error for image {image_id}: {source}")]
    Store { image_id: Uuid, source: RepoError },

    #[error("processing failed for image {image_id}: {message}")]
    Pipeline {
        image_id: Uuid,
        message: String,
        /// Whether ERROR was written to the record
        recorded: bool,
    },
}

pub struct JobProcessor {
    repo: Arc<dyn ImageRepository>,
    store: BlobStore,
    transformer: ImageTransformer,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(repo: Arc<dyn ImageRepository>, store: BlobStore, config: ProcessorConfig) -> Self {
        let transformer = ImageTransformer::new(store.clone(), config.thumbnail_quality);
        Self {
            repo,
            store,
            transformer,
            config,
        }
    }

    /// Process one job payload.
    pub async fn handle(&self, body: &[u8]) -> Result<HandleOutcome, ProcessError> {
        let message = match JobMessage::from_slice(body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse job message, dropping");
                return Ok(dropped(AppError::PermanentMessage(format!(
                    "malformed message: {e}"
                ))));
            }
        };
        let image_id = message.image_id;

        let record = self
            .store_call("get_image", || self.repo.get(image_id))
            .await
            .map_err(|source| ProcessError::Store { image_id, source })?;

        let record = match record {
            Some(record) => record,
            None => {
                warn!(image_id = %image_id, "Image record not found, dropping job");
                return Ok(dropped(AppError::PermanentMessage(format!(
                    "image {image_id} not found"
                ))));
            }
        };

        if record.status.is_terminal() {
            info!(image_id = %image_id, status = %record.status, "Image already processed, dropping job");
            return Ok(HandleOutcome::Dropped {
                reason: format!("image {image_id} is already {}", record.status),
            });
        }

        let entered = self
            .store_call("mark_processing", || self.repo.mark_processing(image_id))
            .await
            .map_err(|source| ProcessError::Store { image_id, source })?;
        if !entered {
            info!(image_id = %image_id, "Image reached a final state concurrently, dropping job");
            return Ok(HandleOutcome::Dropped {
                reason: format!("image {image_id} is no longer processable"),
            });
        }

        info!(
            image_id = %image_id,
            original_path = %message.original_path,
            filename = %message.original_filename,
            "Processing image"
        );

        match self.run_pipeline(image_id, &message.original_path).await {
            Ok(completed) => {
                info!(
                    image_id = %image_id,
                    thumbnails = completed.thumbnails.len(),
                    original_path = %completed.original_path,
                    "Image processed"
                );
                Ok(HandleOutcome::Completed { image_id })
            }
            Err(e) => {
                let message = e.to_string();
                error!(image_id = %image_id, error = %message, "Image processing failed");

                let recorded = match self
                    .store_call("mark_failed", || self.repo.mark_failed(image_id, &message))
                    .await
                {
                    Ok(updated) => updated,
                    Err(store_err) => {
                        error!(
                            image_id = %image_id,
                            error = %store_err,
                            "Failed to record processing error"
                        );
                        false
                    }
                };

                Err(ProcessError::Pipeline {
                    image_id,
                    message,
                    recorded,
                })
            }
        }
    }

    async fn run_pipeline(&self, image_id: Uuid, original_path: &str) -> Result<CompletedImage, AppError> {
        // Older producers sent absolute paths
        let original = self
            .store
            .relativize(Path::new(original_path))
            .map_err(|e| AppError::PermanentMessage(e.to_string()))?;

        // A previous delivery may have died between deleting the original and
        // committing DONE; the compressed copy is then the only source left.
        if !self.store.exists(&original).await {
            let compressed = compressed_path(&original)?;
            if self.store.exists(&compressed).await {
                info!(
                    image_id = %image_id,
                    compressed = %compressed,
                    "Original already replaced by its compressed copy, resuming"
                );
                let thumbnails = self
                    .transformer
                    .generate_thumbnails_from(&compressed, &original, &self.config.thumbnail_sizes)
                    .await?;
                return self.complete(image_id, thumbnails, compressed).await;
            }
        }

        // Header-only read; a corrupt body still fails in generate_thumbnails
        if let Ok(info) = self.transformer.probe(&original).await {
            debug!(
                image_id = %image_id,
                width = info.width,
                height = info.height,
                format = ?info.format,
                "Source image"
            );
        }

        let thumbnails = self
            .transformer
            .generate_thumbnails(&original, &self.config.thumbnail_sizes)
            .await?;
        debug!(image_id = %image_id, count = thumbnails.len(), "Thumbnails generated");

        let compressed = self
            .transformer
            .compress(&original, self.config.compress_quality)
            .await?;

        if compressed != original {
            if let Err(e) = self.store.delete(&original).await {
                warn!(image_id = %image_id, path = %original, error = %e, "Failed to delete uncompressed original");
            }
        }

        self.complete(image_id, thumbnails, compressed).await
    }

    /// Commit DONE with the thumbnail manifest and the compressed original.
    async fn complete(
        &self,
        image_id: Uuid,
        thumbnails: BTreeMap<String, String>,
        compressed: String,
    ) -> Result<CompletedImage, AppError> {
        let completed = CompletedImage {
            thumbnails,
            original_url: BlobStore::public_url(&compressed),
            original_path: compressed,
        };

        let updated = self
            .store_call("mark_done", || self.repo.mark_done(image_id, &completed))
            .await?;
        if !updated {
            return Err(AppError::Pipeline(format!(
                "image {image_id} left PROCESSING before it could be completed"
            )));
        }

        Ok(completed)
    }

    async fn store_call<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, RepoError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
    {
        retry_if(&self.config.retry, operation, RepoError::is_transient, f)
            .await
            .map_err(RetryError::into_inner)
    }
}

#[async_trait]
impl DeliveryHandler for JobProcessor {
    async fn handle(&self, delivery: &Delivery) -> Settlement {
        debug!(
            message_id = %delivery.id,
            attempt = delivery.attempt,
            redelivered = delivery.redelivered,
            "Received job"
        );

        match JobProcessor::handle(self, &delivery.payload).await {
            Ok(_) => Settlement::Ack,
            Err(e) => {
                warn!(message_id = %delivery.id, error = %e, "Job failed, dead-lettering message");
                Settlement::Nack { requeue: false }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryImageRepository;
    use crate::models::{ImageRecord, ImageStatus};
    use crate::test_support::png_bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        repo: Arc<InMemoryImageRepository>,
        store: BlobStore,
        processor: JobProcessor,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let repo = Arc::new(InMemoryImageRepository::new());
        let config = ProcessorConfig {
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let processor = JobProcessor::new(repo.clone(), store.clone(), config);
        Fixture {
            _dir: dir,
            repo,
            store,
            processor,
        }
    }

    /// A record in PROCESSING with its original stored, plus its job payload.
    async fn queued_image(f: &Fixture, bytes: &[u8]) -> (Uuid, String, Vec<u8>) {
        let record = f.repo.create("photo.png").await.unwrap();
        let path = f.store.store(bytes, "photo.png").await.unwrap();
        f.repo.set_original_path(record.id, &path).await.unwrap();
        f.repo.mark_processing(record.id).await.unwrap();

        let body = JobMessage {
            image_id: record.id,
            original_path: path.clone(),
            original_filename: "photo.png".into(),
        }
        .to_vec()
        .unwrap();
        (record.id, path, body)
    }

    #[tokio::test]
    async fn test_happy_path_completes_record() {
        let f = fixture().await;
        let (id, original, body) = queued_image(&f, &png_bytes(640, 480)).await;

        let outcome = f.processor.handle(&body).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Completed { image_id: id });

        let record = f.repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Done);
        assert_eq!(record.thumbnails.len(), 3);
        for path in record.thumbnails.values() {
            assert!(f.store.exists(path).await, "missing {path}");
        }
        assert!(record.original_path.ends_with("_compressed.jpg"));
        assert_eq!(
            record.original_url.as_deref(),
            Some(BlobStore::public_url(&record.original_path).as_str())
        );
        assert!(!f.store.exists(&original).await);
    }

    #[tokio::test]
    async fn test_corrupt_original_records_error() {
        let f = fixture().await;
        let (id, original, body) = queued_image(&f, b"not an image at all").await;

        let err = f.processor.handle(&body).await.unwrap_err();
        assert!(matches!(err, ProcessError::Pipeline { recorded: true, .. }));

        let record = f.repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Error);
        assert!(record.error_message.unwrap().contains("decode"));
        assert!(f.store.exists(&original).await);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let f = fixture().await;
        let outcome = f.processor.handle(b"{\"image_id\": 42}").await.unwrap();
        assert!(matches!(
            outcome,
            HandleOutcome::Dropped { ref reason } if reason.starts_with("Permanent message error")
        ));
        assert!(f.repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_record_is_dropped() {
        let f = fixture().await;
        let body = JobMessage {
            image_id: Uuid::new_v4(),
            original_path: "original/ghost.png".into(),
            original_filename: "ghost.png".into(),
        }
        .to_vec()
        .unwrap();

        let outcome = f.processor.handle(&body).await.unwrap();
        assert!(matches!(
            outcome,
            HandleOutcome::Dropped { ref reason } if reason.contains("not found")
        ));
        assert!(f.repo.is_empty().await);
    }

    #[tokio::test]
    async fn test_resumes_from_compressed_copy_after_crash() {
        let f = fixture().await;
        let (id, original, body) = queued_image(&f, &png_bytes(640, 480)).await;

        // Everything but the DONE commit happened in an earlier delivery
        let transformer = ImageTransformer::new(f.store.clone(), 85);
        transformer
            .generate_thumbnails(&original, &ProcessorConfig::default().thumbnail_sizes)
            .await
            .unwrap();
        let compressed = transformer.compress(&original, 85).await.unwrap();
        f.store.delete(&original).await.unwrap();

        let outcome = f.processor.handle(&body).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Completed { image_id: id });

        let record = f.repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Done);
        assert_eq!(record.original_path, compressed);
        assert_eq!(record.thumbnails.len(), 3);
        for path in record.thumbnails.values() {
            assert!(f.store.exists(path).await, "missing {path}");
        }
    }

    #[tokio::test]
    async fn test_path_outside_upload_root_records_error() {
        let f = fixture().await;
        let (id, _original, _) = queued_image(&f, &png_bytes(8, 8)).await;
        let body = JobMessage {
            image_id: id,
            original_path: "/etc/passwd".into(),
            original_filename: "photo.png".into(),
        }
        .to_vec()
        .unwrap();

        let err = f.processor.handle(&body).await.unwrap_err();
        assert!(matches!(err, ProcessError::Pipeline { recorded: true, .. }));
        let record = f.repo.get(id).await.unwrap().unwrap();
        assert!(record
            .error_message
            .unwrap()
            .starts_with("Permanent message error"));
    }

    #[tokio::test]
    async fn test_redelivery_of_finished_image_is_dropped() {
        let f = fixture().await;
        let (id, _original, body) = queued_image(&f, &png_bytes(32, 32)).await;
        f.processor.handle(&body).await.unwrap();
        let done = f.repo.get(id).await.unwrap().unwrap();

        let outcome = f.processor.handle(&body).await.unwrap();
        assert!(matches!(outcome, HandleOutcome::Dropped { .. }));
        assert_eq!(f.repo.get(id).await.unwrap().unwrap(), done);
    }

    #[tokio::test]
    async fn test_transient_store_errors_are_retried() {
        let f = fixture().await;
        let (id, _original, body) = queued_image(&f, &png_bytes(16, 16)).await;

        f.repo.fail_next(2);
        let outcome = f.processor.handle(&body).await.unwrap();

        assert_eq!(outcome, HandleOutcome::Completed { image_id: id });
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_error() {
        let f = fixture().await;
        let (id, _original, body) = queued_image(&f, &png_bytes(16, 16)).await;

        f.repo.fail_next(3);
        let err = f.processor.handle(&body).await.unwrap_err();
        assert!(matches!(err, ProcessError::Store { image_id, .. } if image_id == id));

        let record = f.repo.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, ImageStatus::Processing);
    }

    #[tokio::test]
    async fn test_absolute_original_path_is_accepted() {
        let f = fixture().await;
        let (id, original, _) = queued_image(&f, &png_bytes(16, 16)).await;
        let body = JobMessage {
            image_id: id,
            original_path: f.store.root().join(&original).display().to_string(),
            original_filename: "photo.png".into(),
        }
        .to_vec()
        .unwrap();

        let outcome = f.processor.handle(&body).await.unwrap();
        assert_eq!(outcome, HandleOutcome::Completed { image_id: id });
    }

    #[tokio::test]
    async fn test_new_record_is_picked_up() {
        let f = fixture().await;
        let mut record = ImageRecord::new("early.png");
        record.original_path = f.store.store(&png_bytes(8, 8), "early.png").await.unwrap();
        let body = JobMessage {
            image_id: record.id,
            original_path: record.original_path.clone(),
            original_filename: "early.png".into(),
        }
        .to_vec()
        .unwrap();
        f.repo.insert(record.clone()).await;

        f.processor.handle(&body).await.unwrap();
        assert_eq!(
            f.repo.get(record.id).await.unwrap().unwrap().status,
            ImageStatus::Done
        );
    }

    #[tokio::test]
    async fn test_settlement_mapping() {
        let f = fixture().await;
        let delivery = |payload: Vec<u8>| Delivery {
            id: "1".into(),
            routing_key: "image_processing".into(),
            payload,
            attempt: 1,
            redelivered: false,
        };

        let dropped = DeliveryHandler::handle(&f.processor, &delivery(b"garbage".to_vec())).await;
        assert_eq!(dropped, Settlement::Ack);

        let (_id, _original, body) = queued_image(&f, b"corrupt").await;
        let failed = DeliveryHandler::handle(&f.processor, &delivery(body)).await;
        assert_eq!(failed, Settlement::Nack { requeue: false });
    }
}
