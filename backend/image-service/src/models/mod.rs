/// Data models for image-service
///
/// - `ImageRecord` / `ImageStatus`: the persisted lifecycle record
/// - `JobMessage`: the producer → worker queue payload
/// - `ThumbnailSize`: a configured `width x height` bound
/// - Response DTOs for the HTTP surface
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::storage::BlobStore;

// ============================================
// Lifecycle
// ============================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[sqlx(type_name = "image_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    New,
    Processing,
    Done,
    Error,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::New => "NEW",
            ImageStatus::Processing => "PROCESSING",
            ImageStatus::Done => "DONE",
            ImageStatus::Error => "ERROR",
        }
    }

    /// DONE and ERROR have no automatic way out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Done | ImageStatus::Error)
    }

    /// Allowed lifecycle edges. PROCESSING → PROCESSING is the idempotent
    /// re-entry performed by the worker after the producer already set it.
    pub fn can_transition_to(&self, next: ImageStatus) -> bool {
        use ImageStatus::*;
        matches!(
            (self, next),
            (New, Processing) | (Processing, Processing) | (Processing, Done) | (Processing, Error)
        )
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(ImageStatus::New),
            "PROCESSING" => Ok(ImageStatus::Processing),
            "DONE" => Ok(ImageStatus::Done),
            "ERROR" => Ok(ImageStatus::Error),
            other => Err(format!("unknown image status: {other}")),
        }
    }
}

// ============================================
// Records
// ============================================

/// Persisted image record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub status: ImageStatus,
    pub original_filename: String,
    /// Storage-relative path of the current original (later: compressed) blob.
    /// Empty until the original has been stored.
    pub original_path: String,
    pub original_url: Option<String>,
    /// size label → storage-relative thumbnail path
    pub thumbnails: BTreeMap<String, String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// A fresh NEW record with a newly assigned id.
    pub fn new(original_filename: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: ImageStatus::New,
            original_filename: original_filename.to_string(),
            original_path: String::new(),
            original_url: None,
            thumbnails: BTreeMap::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_original(&self) -> bool {
        !self.original_path.is_empty()
    }
}

/// Terminal DONE update, applied as one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedImage {
    pub thumbnails: BTreeMap<String, String>,
    pub original_path: String,
    pub original_url: String,
}

// ============================================
// Queue payload
// ============================================

/// Job message published on the `image_processing` routing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub image_id: Uuid,
    pub original_path: String,
    pub original_filename: String,
}

impl JobMessage {
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// ============================================
// Thumbnail bounds
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Manifest key, always the configured bound (not the produced pixel size).
    pub fn label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ThumbnailSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("invalid thumbnail size '{s}', expected WIDTHxHEIGHT"))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| format!("invalid thumbnail width in '{s}'"))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid thumbnail height in '{s}'"))?;
        if width == 0 || height == 0 {
            return Err(format!("thumbnail size '{s}' must be non-zero"));
        }
        Ok(Self { width, height })
    }
}

// ============================================
// HTTP DTOs
// ============================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ImageUploadResponse {
    pub task_id: Uuid,
    pub status: ImageStatus,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ImageResponse {
    pub id: Uuid,
    pub status: ImageStatus,
    pub original_url: Option<String>,
    /// size label → public URL
    pub thumbnails: BTreeMap<String, String>,
}

impl From<ImageRecord> for ImageResponse {
    fn from(record: ImageRecord) -> Self {
        let original_url = record
            .has_original()
            .then(|| BlobStore::public_url(&record.original_path));
        let thumbnails = record
            .thumbnails
            .iter()
            .map(|(label, path)| (label.clone(), BlobStore::public_url(path)))
            .collect();

        Self {
            id: record.id,
            status: record.status,
            original_url,
            thumbnails,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    /// Queue broker connectivity; the key name is part of the public wire format.
    #[serde(rename = "rabbitmq")]
    pub queue: String,
    pub service: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
    pub docs: String,
}

/// Multipart form accepted by `POST /api/v1/images` (documentation only)
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct ImageUploadForm {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}
