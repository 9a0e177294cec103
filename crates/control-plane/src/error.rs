use axum::{response::{IntoResponse, Response}, Json, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiErrorBody { pub code: &'static str, pub message: String }

#[derive(Debug, Clone)]
pub struct ApiError { pub status: StatusCode, pub code: &'static str, pub message: String }

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into() }
    }
    pub fn not_found(msg: impl Into<String>) -> Self { Self::new(StatusCode::NOT_FOUND, "not_found", msg) }
    pub fn internal(msg: impl Into<String>) -> Self { Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", msg) }
    pub fn bad_request(msg: impl Into<String>) -> Self { Self::new(StatusCode::BAD_REQUEST, "bad_request", msg) }
    pub fn capacity(msg: impl Into<String>) -> Self { Self::new(StatusCode::SERVICE_UNAVAILABLE, "capacity", msg) }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.code, self.message) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody { code: self.code, message: self.message };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Failure taxonomy for the scan lifecycle. Errors raised before the
/// background task is spawned surface to the HTTP caller; errors inside the
/// task are written to the store as terminal state and logged, never thrown.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("environment error: {0}")]
    Environment(String),
    #[error("failed to record scan status: {0}")]
    StoreWrite(String),
    #[error("helm deploy failed: {0}")]
    Deploy(String),
    #[error("scheduler error: {0}")]
    Scheduler(String),
    #[error("job '{job_name}' was not registered in Kubernetes within {attempts} attempts")]
    Registration { job_name: String, attempts: u32 },
    #[error("no pod found for job '{job_name}' within {attempts} attempts")]
    PodLookup { job_name: String, attempts: u32 },
    #[error("pod '{pod}' entered failure state '{phase}'")]
    PodFailed { pod: String, phase: String },
    #[error("job '{job_name}' did not complete within {attempts} attempts")]
    JobTimeout { job_name: String, attempts: u32 },
    #[error("{message}; pod logs: {logs}")]
    ExecutionFailed { message: String, logs: String },
    #[error("max concurrent scans reached ({0})")]
    Capacity(usize),
}

impl From<ScanError> for ApiError {
    fn from(e: ScanError) -> Self {
        match e {
            ScanError::Configuration(msg) => ApiError::bad_request(msg),
            ScanError::Environment(msg) => ApiError::internal(msg),
            ScanError::StoreWrite(msg) => ApiError::internal(format!("failed to initialize scan: {msg}")),
            ScanError::Capacity(n) => ApiError::capacity(format!("max concurrent scans reached ({n})")),
            other => ApiError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_maps_to_bad_request() {
        let api: ApiError = ScanError::Configuration("missing value".into()).into();
        assert_eq!(api.status, StatusCode::BAD_REQUEST);
        assert_eq!(api.code, "bad_request");
    }

    #[test]
    fn store_write_maps_to_internal() {
        let api: ApiError = ScanError::StoreWrite("s3 down".into()).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(api.message.contains("s3 down"));
    }

    #[test]
    fn capacity_maps_to_service_unavailable() {
        let api: ApiError = ScanError::Capacity(5).into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
