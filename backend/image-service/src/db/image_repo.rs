/// Postgres image repository
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use super::{ImageRepository, RepoError};
use crate::models::{CompletedImage, ImageRecord, ImageStatus};

const SELECT_COLUMNS: &str = r#"
    id, status, original_filename, original_path, original_url,
    thumbnails, error_message, created_at, updated_at
"#;

#[derive(Debug, FromRow)]
struct ImageRow {
    id: Uuid,
    status: ImageStatus,
    original_filename: String,
    original_path: String,
    original_url: Option<String>,
    thumbnails: Option<Json<BTreeMap<String, String>>>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ImageRow> for ImageRecord {
    fn from(row: ImageRow) -> Self {
        Self {
            id: row.id,
            status: row.status,
            original_filename: row.original_filename,
            original_path: row.original_path,
            original_url: row.original_url,
            thumbnails: row.thumbnails.map(|j| j.0).unwrap_or_default(),
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct PgImageRepository {
    pool: PgPool,
}

impl PgImageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    async fn create(&self, original_filename: &str) -> Result<ImageRecord, RepoError> {
        let query = format!(
            "INSERT INTO images (id, status, original_filename, original_path) \
             VALUES ($1, 'NEW', $2, '') RETURNING {SELECT_COLUMNS}"
        );
        let row: ImageRow = sqlx::query_as(&query)
            .bind(Uuid::new_v4())
            .bind(original_filename)
            .fetch_one(&self.pool)
            .await?;

        debug!(image_id = %row.id, "Created image record");
        Ok(row.into())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ImageRecord>, RepoError> {
        let query = format!("SELECT {SELECT_COLUMNS} FROM images WHERE id = $1");
        let row: Option<ImageRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn set_original_path(&self, id: Uuid, path: &str) -> Result<(), RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET original_path = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'NEW'
            "#,
        )
        .bind(id)
        .bind(path)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET status = 'PROCESSING', updated_at = NOW()
            WHERE id = $1 AND status IN ('NEW', 'PROCESSING')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_done(&self, id: Uuid, done: &CompletedImage) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET status = 'DONE',
                thumbnails = $2,
                original_path = $3,
                original_url = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(Json(&done.thumbnails))
        .bind(&done.original_path)
        .bind(&done.original_url)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE images
            SET status = 'ERROR', error_message = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn referenced_paths(&self) -> Result<HashSet<String>, RepoError> {
        // TODO: stream with `fetch` instead of buffering once tables get large
        let rows: Vec<(String, Option<Json<BTreeMap<String, String>>>)> =
            sqlx::query_as("SELECT original_path, thumbnails FROM images")
                .fetch_all(&self.pool)
                .await?;

        let mut paths = HashSet::new();
        for (original, thumbnails) in rows {
            if !original.is_empty() {
                paths.insert(original);
            }
            if let Some(Json(map)) = thumbnails {
                paths.extend(map.into_values());
            }
        }
        Ok(paths)
    }

    async fn ping(&self) -> Result<(), RepoError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
