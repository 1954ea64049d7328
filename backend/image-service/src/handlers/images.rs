/// Image handlers - upload and status endpoints
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use bytes::BytesMut;
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, ErrorResponse, Result};
use crate::models::{ImageResponse, ImageUploadForm, ImageUploadResponse};
use crate::state::AppState;

const FILE_FIELD: &str = "file";

/// Upload an image for processing
///
/// Reads the `file` field of a multipart form. The size cap is enforced
/// while streaming, so an oversized body is rejected before anything is
/// stored.
#[utoipa::path(
    post,
    path = "/api/v1/images",
    tag = "images",
    request_body(
        content = ImageUploadForm,
        content_type = "multipart/form-data",
        description = "Image file in the `file` field"
    ),
    responses(
        (status = 200, description = "Image queued for processing", body = ImageUploadResponse),
        (status = 400, description = "Missing filename, unsupported type or too large", body = ErrorResponse),
        (status = 503, description = "Queue unavailable", body = ErrorResponse),
    )
)]
pub async fn upload_image(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse> {
    let policy = state.uploads.policy().clone();

    while let Some(item) = payload.next().await {
        let mut field = item.map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {e}")))?;

        if field.name() != Some(FILE_FIELD) {
            debug!(field = ?field.name(), "Skipping multipart field");
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| AppError::BadRequest(format!("Invalid multipart body: {e}")))?;
            }
            continue;
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let filename = policy.check_filename(filename.as_deref())?;

        let mut data = BytesMut::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| {
                warn!(error = %e, "Error reading upload field");
                AppError::BadRequest(format!("Failed to read upload: {e}"))
            })?;
            policy.check_size(data.len() + chunk.len())?;
            data.extend_from_slice(&chunk);
        }

        let receipt = state.uploads.submit(&filename, &data).await?;

        return Ok(HttpResponse::Ok().json(ImageUploadResponse {
            task_id: receipt.image_id,
            status: receipt.status,
            message: "Image uploaded and queued for processing".to_string(),
        }));
    }

    Err(AppError::Validation("No file provided".to_string()))
}

/// Get image status and URLs
#[utoipa::path(
    get,
    path = "/api/v1/images/{id}",
    tag = "images",
    params(("id" = Uuid, Path, description = "Image id returned by the upload")),
    responses(
        (status = 200, description = "Current image state", body = ImageResponse),
        (status = 400, description = "Malformed id", body = ErrorResponse),
        (status = 404, description = "Image not found", body = ErrorResponse),
    )
)]
pub async fn get_image(state: web::Data<AppState>, id: web::Path<String>) -> Result<HttpResponse> {
    let image_id = Uuid::parse_str(&id)
        .map_err(|_| AppError::BadRequest("Invalid image ID".to_string()))?;

    let record = state.uploads.fetch(image_id).await?;

    Ok(HttpResponse::Ok().json(ImageResponse::from(record)))
}
