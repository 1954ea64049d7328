/// HTTP handlers
///
/// - Images: upload and status lookup
/// - Health: dependency probes and the service banner
use actix_web::{web, HttpResponse};

pub mod health;
pub mod images;

pub use health::{health_check, root};
pub use images::{get_image, upload_image};

/// Register every route. Shared by the server binary and the HTTP tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(root))
        .route(
            crate::openapi::ApiDoc::openapi_json_path(),
            web::get().to(|| async {
                use utoipa::OpenApi;
                HttpResponse::Ok().json(crate::openapi::ApiDoc::openapi())
            }),
        )
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health_check))
                .service(
                    web::scope("/images")
                        .route("", web::post().to(upload_image))
                        .route("/{id}", web::get().to(get_image)),
                ),
        );
}
