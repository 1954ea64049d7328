/// In-memory image repository
///
/// Same guarded transitions as the Postgres repository, backed by a map.
/// `fail_next` lets tests simulate a flaky record store.
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ImageRepository, RepoError};
use crate::models::{CompletedImage, ImageRecord, ImageStatus};

#[derive(Default)]
pub struct InMemoryImageRepository {
    records: RwLock<HashMap<Uuid, ImageRecord>>,
    failures: AtomicU32,
}

impl InMemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Insert a record as-is (test setup).
    pub async fn insert(&self, record: ImageRecord) {
        self.records.write().await.insert(record.id, record);
    }

    fn check_available(&self) -> Result<(), RepoError> {
        let took = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            return Err(RepoError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    async fn transition<F>(
        &self,
        id: Uuid,
        next: ImageStatus,
        apply: F,
    ) -> Result<bool, RepoError>
    where
        F: FnOnce(&mut ImageRecord) + Send,
    {
        self.check_available()?;
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if record.status.can_transition_to(next) => {
                record.status = next;
                apply(record);
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ImageRepository for InMemoryImageRepository {
    async fn create(&self, original_filename: &str) -> Result<ImageRecord, RepoError> {
        self.check_available()?;
        let record = ImageRecord::new(original_filename);
        self.records.write().await.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, RepoError> {
        self.check_available()?;
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn set_original_path(&self, id: Uuid, path: &str) -> Result<(), RepoError> {
        self.check_available()?;
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if record.status == ImageStatus::New => {
                record.original_path = path.to_string();
                record.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(RepoError::NotFound(id)),
        }
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool, RepoError> {
        self.transition(id, ImageStatus::Processing, |_| {}).await
    }

    async fn mark_done(&self, id: Uuid, done: &CompletedImage) -> Result<bool, RepoError> {
        let done = done.clone();
        self.transition(id, ImageStatus::Done, move |record| {
            record.thumbnails = done.thumbnails;
            record.original_path = done.original_path;
            record.original_url = Some(done.original_url);
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<bool, RepoError> {
        let message = error_message.to_string();
        self.transition(id, ImageStatus::Error, move |record| {
            record.error_message = Some(message);
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepoError> {
        self.check_available()?;
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn referenced_paths(&self) -> Result<HashSet<String>, RepoError> {
        self.check_available()?;
        let records = self.records.read().await;
        let mut paths = HashSet::new();
        for record in records.values() {
            if record.has_original() {
                paths.insert(record.original_path.clone());
            }
            paths.extend(record.thumbnails.values().cloned());
        }
        Ok(paths)
    }

    async fn ping(&self) -> Result<(), RepoError> {
        self.check_available()
    }
}
