/// OpenAPI documentation for the image processing service
use utoipa::OpenApi;

use crate::error::ErrorResponse;
use crate::handlers;
use crate::models::{
    HealthResponse, ImageResponse, ImageStatus, ImageUploadForm, ImageUploadResponse,
    RootResponse,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Image Processing Service API",
        version = "1.0.0",
        description = "Accepts image uploads, queues them for background processing and reports their status. Workers generate bounded thumbnails and a recompressed original for every upload.",
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8000", description = "Development server"),
    ),
    paths(
        handlers::images::upload_image,
        handlers::images::get_image,
        handlers::health::health_check,
        handlers::health::root,
    ),
    components(schemas(
        ImageUploadForm,
        ImageUploadResponse,
        ImageResponse,
        ImageStatus,
        HealthResponse,
        RootResponse,
        ErrorResponse,
    )),
    tags(
        (name = "images", description = "Image upload and processing status"),
        (name = "health", description = "Service health checks"),
    ),
)]
pub struct ApiDoc;

impl ApiDoc {
    pub fn title() -> &'static str {
        "Image Processing Service"
    }

    pub fn openapi_json_path() -> &'static str {
        "/api/v1/openapi.json"
    }
}
