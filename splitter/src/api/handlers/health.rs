use axum::Json;

use crate::api::models::health::HealthResponse;

/// Liveness check. Always healthy while the process is serving.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    summary = "Health check",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
