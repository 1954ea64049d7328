/// Error types for image-service
///
/// Component errors (record store, blob store, transform engine, queue) are
/// folded into `AppError` at the service boundary, and `AppError` is turned
/// into a JSON HTTP response for API clients.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::db::RepoError;
use crate::services::queue::QueueError;
use crate::services::transform::TransformError;
use crate::storage::BlobError;

/// Result type for image-service operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    /// Rejected upload (missing filename, extension, size)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Original could not be decoded as an image
    #[error("Decode error: {0}")]
    Decode(String),

    /// Queue unreachable or refused the message
    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// Job payload that can never succeed
    #[error("Permanent message error: {0}")]
    PermanentMessage(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// JSON error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub code: String,
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "IMAGE_NOT_FOUND",
            AppError::Decode(_) => "DECODE_ERROR",
            AppError::Publish(_) => "QUEUE_PUBLISH_ERROR",
            AppError::Connection(_) => "CONNECTION_ERROR",
            AppError::PermanentMessage(_) => "PERMANENT_MESSAGE_ERROR",
            AppError::Pipeline(_) => "PIPELINE_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Io(_) => "STORAGE_ERROR",
            AppError::Internal(_) => "INTERNAL_SERVER_ERROR",
            AppError::BadRequest(_) => "INVALID_REQUEST",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Publish(_) | AppError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Decode(_)
            | AppError::PermanentMessage(_)
            | AppError::Pipeline(_)
            | AppError::Database(_)
            | AppError::Io(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let response = ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message: self.to_string(),
            status: status.as_u16(),
            code: self.code().to_string(),
        };

        HttpResponse::build(status).json(response)
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(id) => AppError::NotFound(format!("image {id}")),
            RepoError::Unavailable(msg) => AppError::Connection(msg),
            RepoError::Database(e) => AppError::Database(e.to_string()),
        }
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(path) => AppError::NotFound(format!("blob {path}")),
            BlobError::InvalidPath(path) => AppError::BadRequest(format!("invalid path {path}")),
            BlobError::Io(e) => AppError::Io(e),
        }
    }
}

impl From<TransformError> for AppError {
    fn from(err: TransformError) -> Self {
        match err {
            TransformError::NotFound(path) => AppError::NotFound(format!("image file {path}")),
            TransformError::Decode { .. } => AppError::Decode(err.to_string()),
            other => AppError::Pipeline(other.to_string()),
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotConnected | QueueError::Connection(_) => {
                AppError::Connection(err.to_string())
            }
            other => AppError::Publish(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
