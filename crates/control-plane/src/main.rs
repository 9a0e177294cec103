//! Binary entrypoint for the Argus scan control plane.
use anyhow::Context;
use control_plane::config::{ScanRegistry, Settings};
use control_plane::helm::HelmCli;
use control_plane::k8s::KubeScheduler;
use control_plane::services::{OrchestratorConfig, ScanOrchestrator, StatusService, TokioSleeper};
use control_plane::storage::store_from_env;
use control_plane::summarizer::summarizer_from_env;
use control_plane::telemetry::{normalize_path, HTTP_REQUESTS, HTTP_REQUEST_DURATION};
use control_plane::{build_router, AppState};
use axum::{body::Body, http::{HeaderValue, Request}, middleware, response::Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::{info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let settings = Settings::from_env();
    info!(namespace = %settings.namespace, chart = %settings.chart_path.display(), "starting scan control plane");

    let store = store_from_env(&settings.bucket).await;
    if let Err(e) = store.ensure_prefixes().await {
        warn!(error = %e, "failed to ensure store prefixes; continuing");
    }

    let scheduler = Arc::new(
        KubeScheduler::try_default(&settings.namespace)
            .await
            .context("kubernetes cluster must be reachable")?,
    );
    let deployer = Arc::new(HelmCli::new(settings.helm_timeout));
    let summarizer = summarizer_from_env(&settings.model_id).await;
    let registry = Arc::new(ScanRegistry::load(&settings.scan_config_path));

    let orchestrator = Arc::new(ScanOrchestrator::new(
        store.clone(),
        scheduler.clone(),
        deployer,
        summarizer,
        OrchestratorConfig::from(&settings),
        Arc::new(TokioSleeper),
    ));
    let status = Arc::new(StatusService::new(store, scheduler));
    let state = AppState { orchestrator, status, registry };

    async fn track_metrics(mut req: Request<Body>, next: axum::middleware::Next) -> Response {
        let method = req.method().clone();
        let path_label = normalize_path(req.uri().path());
        let req_id = Uuid::new_v4();
        req.extensions_mut().insert(req_id);
        let start = std::time::Instant::now();
        let mut resp = next.run(req).await;
        let status = resp.status().as_u16().to_string();
        HTTP_REQUESTS.with_label_values(&[method.as_str(), path_label.as_str(), status.as_str()]).inc();
        HTTP_REQUEST_DURATION.with_label_values(&[method.as_str(), path_label.as_str()]).observe(start.elapsed().as_secs_f64());
        if let Ok(value) = HeaderValue::from_str(&req_id.to_string()) {
            resp.headers_mut().insert("x-request-id", value);
        }
        resp
    }

    const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB
    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(track_metrics));

    let addr: SocketAddr = std::env::var("ARGUS_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()
        .context("ARGUS_BIND must be a socket address")?;
    info!(%addr, "control-plane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install ctrl_c handler");
            return;
        }
        info!(target: "shutdown.signal", "received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await; // graceful drain window
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
