/// Record store access layer
///
/// This module provides:
/// - `ImageRepository`: the operations the producer, worker and reconciler
///   need on image records
/// - `PgImageRepository`: the Postgres implementation (sqlx)
/// - `InMemoryImageRepository`: a process-local implementation for tests and
///   single-process setups
///
/// Every status-changing write is guarded on the current status so a late or
/// duplicate writer can never move a record backwards.
use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{CompletedImage, ImageRecord};

pub mod image_repo;
pub mod memory;

pub use image_repo::PgImageRepository;
pub use memory::InMemoryImageRepository;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("image {0} not found")]
    NotFound(Uuid),
}

impl RepoError {
    /// Errors worth retrying: connectivity and pool exhaustion, not
    /// constraint violations or bad rows.
    pub fn is_transient(&self) -> bool {
        match self {
            RepoError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            RepoError::Unavailable(_) => true,
            RepoError::NotFound(_) => false,
        }
    }
}

#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Insert a NEW record with a fresh id and an empty original path.
    async fn create(&self, original_filename: &str) -> Result<ImageRecord, RepoError>;

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, RepoError>;

    /// Attach the stored original while the record is still NEW.
    async fn set_original_path(&self, id: Uuid, path: &str) -> Result<(), RepoError>;

    /// NEW|PROCESSING → PROCESSING. `false` when the record is terminal.
    async fn mark_processing(&self, id: Uuid) -> Result<bool, RepoError>;

    /// PROCESSING → DONE with the full result in one write.
    /// `false` when the record was not PROCESSING.
    async fn mark_done(&self, id: Uuid, done: &CompletedImage) -> Result<bool, RepoError>;

    /// PROCESSING → ERROR. `false` when the record was not PROCESSING.
    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<bool, RepoError>;

    /// Remove a record (producer rollback). `false` when it did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool, RepoError>;

    /// Every blob path any record points at (originals and thumbnails).
    async fn referenced_paths(&self) -> Result<HashSet<String>, RepoError>;

    async fn ping(&self) -> Result<(), RepoError>;
}
