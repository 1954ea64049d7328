//! Blob reconciliation
//!
//! Removes stored files that no record points at: leftovers from uploads
//! whose rollback was interrupted, thumbnails of jobs that died before DONE,
//! stray temp files. Files younger than the grace period are kept because an
//! in-flight upload or job may not have written its record yet.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::db::ImageRepository;
use crate::error::Result;
use crate::storage::{BlobStore, ORIGINAL_AREA, THUMBNAIL_AREA};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub referenced: usize,
    pub removed: usize,
    pub skipped_recent: usize,
    pub failed: usize,
}

pub struct Reconciler {
    repo: Arc<dyn ImageRepository>,
    store: BlobStore,
    grace: Duration,
}

impl Reconciler {
    pub fn new(repo: Arc<dyn ImageRepository>, store: BlobStore, grace: Duration) -> Self {
        Self { repo, store, grace }
    }

    /// Scan both storage areas. With `dry_run` nothing is deleted, but the
    /// report counts what would have been.
    pub async fn run(&self, dry_run: bool) -> Result<ReconcileReport> {
        let referenced = self.repo.referenced_paths().await?;
        let now = SystemTime::now();
        let mut report = ReconcileReport::default();

        for area in [ORIGINAL_AREA, THUMBNAIL_AREA] {
            for entry in self.store.list(area).await? {
                report.scanned += 1;

                if referenced.contains(&entry.path) {
                    report.referenced += 1;
                    continue;
                }

                let age = now.duration_since(entry.modified).unwrap_or_default();
                if age < self.grace {
                    report.skipped_recent += 1;
                    continue;
                }

                if dry_run {
                    debug!(path = %entry.path, "Would remove orphaned blob");
                    report.removed += 1;
                    continue;
                }

                match self.store.delete(&entry.path).await {
                    Ok(_) => {
                        debug!(path = %entry.path, "Removed orphaned blob");
                        report.removed += 1;
                    }
                    Err(e) => {
                        warn!(path = %entry.path, error = %e, "Failed to remove orphaned blob");
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            dry_run,
            scanned = report.scanned,
            referenced = report.referenced,
            removed = report.removed,
            skipped_recent = report.skipped_recent,
            failed = report.failed,
            "Blob reconciliation finished"
        );
        Ok(report)
    }
}
