/// Health and service-info endpoints
use actix_web::{web, HttpResponse};
use tracing::warn;

use crate::models::{HealthResponse, RootResponse};
use crate::state::AppState;

pub const SERVICE_NAME: &str = "image-processing";

/// Probe the record store and the queue broker
///
/// Always answers 200; the body says which dependency is down.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "health",
    responses((status = 200, description = "Dependency status", body = HealthResponse))
)]
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let (database, queue) = tokio::join!(state.repo.ping(), state.queue.ping());

    let database = match database {
        Ok(()) => "healthy",
        Err(e) => {
            warn!(error = %e, "Database health check failed");
            "unhealthy"
        }
    };
    let queue = match queue {
        Ok(()) => "healthy",
        Err(e) => {
            warn!(error = %e, "Queue health check failed");
            "unhealthy"
        }
    };
    let status = if database == "healthy" && queue == "healthy" {
        "healthy"
    } else {
        "unhealthy"
    };

    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        database: database.to_string(),
        queue: queue.to_string(),
        service: SERVICE_NAME.to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/",
    tag = "health",
    responses((status = 200, description = "Service banner", body = RootResponse))
)]
pub async fn root(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(RootResponse {
        message: crate::openapi::ApiDoc::title().to_string(),
        version: state.version.clone(),
        docs: crate::openapi::ApiDoc::openapi_json_path().to_string(),
    })
}
