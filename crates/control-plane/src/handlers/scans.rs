use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::error::{ApiError, ApiResult};
use crate::models::{ScanConfigMap, StatusView};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScanRequest {
    pub tool: String,
    pub mode: String,
    /// Per-flag configuration; omitted flags fall back to the chart defaults.
    #[serde(default)]
    pub config: ScanConfigMap,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScanResponse {
    pub scan_id: String,
    pub status: String,
    pub message: String,
}

/// Trigger a scan. The call returns as soon as the scan is durably
/// recorded; execution continues in the background and is observed via
/// `GET /scan/{scan_id}`.
#[utoipa::path(post, path = "/scan", tag = "scans",
    request_body = ScanRequest,
    responses(
        (status = 202, description = "Scan accepted", body = ScanResponse),
        (status = 400, description = "Unknown tool/mode or invalid flag configuration", body = crate::error::ApiErrorBody),
        (status = 503, description = "Concurrency ceiling reached", body = crate::error::ApiErrorBody),
    ))]
pub async fn start_scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> ApiResult<(StatusCode, Json<ScanResponse>)> {
    state
        .registry
        .validate(&req.tool, &req.mode)
        .map_err(ApiError::bad_request)?;
    state.orchestrator.check_capacity().await?;
    let record = state
        .orchestrator
        .start_scan(&req.tool, &req.mode, &req.config)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ScanResponse {
            scan_id: record.scan_id,
            status: record.status.as_str().to_string(),
            message: format!("{} {} scan initiated", req.tool, req.mode),
        }),
    ))
}

/// Current status of a scan, reconciled against the live job.
#[utoipa::path(get, path = "/scan/{scan_id}", tag = "scans",
    params(("scan_id" = String, Path, description = "Scan identifier returned by POST /scan")),
    responses(
        (status = 200, description = "Scan status", body = StatusView),
        (status = 404, description = "No scan with this id", body = crate::error::ApiErrorBody),
    ))]
pub async fn scan_status(
    State(state): State<AppState>,
    Path(scan_id): Path<String>,
) -> ApiResult<Json<StatusView>> {
    let view = state
        .status
        .get_scan_status(&scan_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("No scan found with ID {scan_id}")))?;
    Ok(Json(view))
}

/// Available tools, modes, and their flag defaults.
#[utoipa::path(get, path = "/scan-config", tag = "scans",
    responses((status = 200, description = "Scan tool registry")))]
pub async fn scan_config(State(state): State<AppState>) -> Json<Value> {
    Json(state.registry.describe())
}
