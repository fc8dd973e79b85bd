use actix_web::HttpResponse;

/// GET /health_check
///
/// Liveness only; collaborators are not probed.
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
