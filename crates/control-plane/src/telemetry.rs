use prometheus::{TextEncoder, Encoder, Registry, IntCounter, IntCounterVec, HistogramVec, opts, histogram_opts};
use once_cell::sync::Lazy;
use axum::{response::IntoResponse, http::StatusCode};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("http_requests_total", "HTTP request count"), &["method", "path", "status"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(histogram_opts!("http_request_duration_seconds", "HTTP request latency"), &["method", "path"]).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static SCANS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("scans_started_total", "Scans accepted and initiated").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SCANS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("scans_completed_total", "Scans that reached completed state").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SCANS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("scans_failed_total", "Scans that reached failed state").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SCANS_REJECTED_CAPACITY: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("scans_rejected_capacity_total", "Scan requests rejected by the concurrency ceiling").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response()
}

/// Collapse scan ids so metrics keep a bounded label cardinality.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    let mut out: Vec<String> = Vec::with_capacity(segments.len());
    for seg in segments {
        if looks_like_scan_id(seg) {
            out.push(":scan_id".to_string());
        } else {
            out.push(seg.to_string());
        }
    }
    out.join("/")
}

fn looks_like_scan_id(seg: &str) -> bool {
    // {14-digit timestamp}-{8 hex chars}
    match seg.split_once('-') {
        Some((ts, suffix)) => {
            ts.len() == 14
                && ts.chars().all(|c| c.is_ascii_digit())
                && suffix.len() == 8
                && suffix.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}
