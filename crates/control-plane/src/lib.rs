pub mod config;
pub mod error;
pub mod handlers;
pub mod helm;
pub mod k8s;
pub mod models;
pub mod services;
pub mod storage;
pub mod summarizer;
pub mod telemetry;
pub mod test_support;

use axum::{routing::{get, post}, Router};
use std::sync::Arc;
use utoipa::OpenApi;

use crate::config::ScanRegistry;
use crate::handlers::{health::{health, readyz}, scans::{scan_config, scan_status, start_scan}};
use crate::services::{ScanOrchestrator, StatusService};
use crate::telemetry::metrics_handler;
use axum::response::Html;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ScanOrchestrator>,
    pub status: Arc<StatusService>,
    pub registry: Arc<ScanRegistry>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::health::readyz,
        handlers::scans::start_scan,
        handlers::scans::scan_status,
        handlers::scans::scan_config,
    ),
    components(schemas(
        error::ApiErrorBody,
        handlers::scans::ScanRequest,
        handlers::scans::ScanResponse,
        models::FlagConfig,
        models::StatusView,
    )),
    tags( (name = "argus", description = "Argus Scan Control Plane API") )
)]
pub struct ApiDoc;

async fn swagger_ui() -> Html<String> {
    let html = r#"<!DOCTYPE html>
<html lang=\"en\">
<head><meta charset=\"UTF-8\"/><title>Argus API Docs</title>
<link rel=\"stylesheet\" href=\"https://unpkg.com/swagger-ui-dist@5/swagger-ui.css\" />
</head>
<body>
<div id=\"swagger-ui\"></div>
<script src=\"https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js\"></script>
<script>
window.onload = () => { SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' }); };
</script>
</body></html>"#;
    Html(html.to_string())
}

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .route("/scan", post(start_scan))
        .route("/scan/:scan_id", get(scan_status))
        .route("/scan-config", get(scan_config))
        .route("/openapi.json", get(|| async move { axum::Json(openapi.clone()) }))
        .route("/swagger", get(swagger_ui))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::{Request, StatusCode}};
    use serde_json::json;
    use tower::util::ServiceExt;

    use crate::test_support::harness;

    fn test_app() -> Router {
        let h = harness();
        let status = Arc::new(StatusService::new(h.store.clone(), h.scheduler.clone()));
        build_router(AppState {
            orchestrator: h.orchestrator,
            status,
            registry: Arc::new(ScanRegistry::builtin_default()),
        })
    }

    #[tokio::test]
    async fn health_ok() {
        let app = test_app();
        let res = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v, json!({"status":"ok"}));
    }

    #[tokio::test]
    async fn readiness_ok() {
        let app = test_app();
        let res = app.oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scan_config_lists_builtin_tools() {
        let app = test_app();
        let res = app.oneshot(Request::builder().uri("/scan-config").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 64 * 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(v["tools"]["owasp"].get("baseline").is_some());
    }

    #[tokio::test]
    async fn start_scan_unknown_tool_is_bad_request() {
        let app = test_app();
        let body = json!({"tool": "nessus", "mode": "baseline"}).to_string();
        let req = Request::builder().method("POST").uri("/scan")
            .header("content-type", "application/json")
            .body(Body::from(body)).unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["code"], "bad_request");
    }

    #[tokio::test]
    async fn start_scan_bad_json_is_rejected() {
        let app = test_app();
        let req = Request::builder().method("POST").uri("/scan")
            .header("content-type", "application/json")
            .body(Body::from("{invalid")).unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_scan_is_404() {
        let app = test_app();
        let res = app
            .oneshot(Request::builder().uri("/scan/20250101120000-deadbeef").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["code"], "not_found");
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let app = test_app();
        let res = app.oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), 1024 * 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(v["paths"].get("/scan").is_some());
        assert!(v["paths"].get("/scan/{scan_id}").is_some());
    }
}
