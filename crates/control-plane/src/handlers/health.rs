use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::warn;

use crate::AppState;

/// Liveness: the process is up and serving.
#[utoipa::path(get, path = "/health", tag = "health",
    responses((status = 200, description = "Service is alive")))]
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Readiness: the status store answers reads. Scans cannot be accepted
/// without it, so a failing probe takes the instance out of rotation.
#[utoipa::path(get, path = "/readyz", tag = "health",
    responses(
        (status = 200, description = "Service is ready"),
        (status = 503, description = "Status store unreachable"),
    ))]
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.status.probe().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            warn!(error = %e, "readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "status": "unavailable" })))
        }
    }
}
