use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::models::ScanRecord;

/// Key scheme is a pure function of the scan id; status and report live
/// under separate prefixes so lifecycle tracking and scan output can be
/// listed and retained independently.
pub fn status_key(scan_id: &str) -> String { format!("scan-status/{scan_id}.json") }
pub fn report_key(scan_id: &str) -> String { format!("scan-reports/{scan_id}.json") }

/// Object-store adapter for scan status and report records.
///
/// The backing store is eventually consistent and NotFound is a valid,
/// expected state everywhere: a status read can miss a record the scan job
/// has not written yet, and callers treat that as "not yet" rather than an
/// error.
#[async_trait]
pub trait StatusStore: Send + Sync + 'static {
    async fn put_status(&self, scan_id: &str, record: &ScanRecord) -> anyhow::Result<()>;
    async fn get_status(&self, scan_id: &str) -> anyhow::Result<Option<ScanRecord>>;
    async fn put_report(&self, scan_id: &str, report: &Value) -> anyhow::Result<()>;
    async fn get_report(&self, scan_id: &str) -> anyhow::Result<Option<Value>>;
    async fn head_report(&self, scan_id: &str) -> anyhow::Result<bool> {
        Ok(self.get_report(scan_id).await?.is_some())
    }
    /// Best-effort creation of the status/report prefixes at startup.
    async fn ensure_prefixes(&self) -> anyhow::Result<()> { Ok(()) }
}

/// In-memory backend for tests and local development. Records every write
/// so tests can assert on write counts and observed status sequences.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    objects: Mutex<HashMap<String, String>>,
    write_log: Mutex<Vec<(String, String)>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self { Self::default() }

    /// Raw stored bytes for a key, for byte-level assertions.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Insert raw bytes directly, bypassing serialization.
    pub fn put_raw(&self, key: &str, body: &str) {
        self.objects.lock().unwrap().insert(key.to_string(), body.to_string());
    }

    /// Every `(key, body)` write in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.write_log.lock().unwrap().clone()
    }

    pub fn writes_for(&self, key: &str) -> usize {
        self.write_log.lock().unwrap().iter().filter(|(k, _)| k == key).count()
    }

    fn put(&self, key: String, body: String) {
        self.objects.lock().unwrap().insert(key.clone(), body.clone());
        self.write_log.lock().unwrap().push((key, body));
    }

    fn get(&self, key: &str) -> Option<String> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn put_status(&self, scan_id: &str, record: &ScanRecord) -> anyhow::Result<()> {
        self.put(status_key(scan_id), serde_json::to_string(record)?);
        Ok(())
    }
    async fn get_status(&self, scan_id: &str) -> anyhow::Result<Option<ScanRecord>> {
        match self.get(&status_key(scan_id)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
    async fn put_report(&self, scan_id: &str, report: &Value) -> anyhow::Result<()> {
        self.put(report_key(scan_id), serde_json::to_string_pretty(report)?);
        Ok(())
    }
    async fn get_report(&self, scan_id: &str) -> anyhow::Result<Option<Value>> {
        match self.get(&report_key(scan_id)) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(feature = "s3")]
pub struct S3StatusStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

#[cfg(feature = "s3")]
impl std::fmt::Debug for S3StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3StatusStore").field("bucket", &self.bucket).finish()
    }
}

#[cfg(feature = "s3")]
impl S3StatusStore {
    pub async fn from_env(bucket: &str) -> Self {
        use aws_config::BehaviorVersion;
        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".into());
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(region))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Ok(ep) = std::env::var("ARGUS_S3_ENDPOINT_URL") {
            // Path-style addressing for MinIO-style endpoints
            builder = builder.endpoint_url(ep).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        info!(bucket = %bucket, "status store: s3 backend");
        Self { client, bucket: bucket.to_string() }
    }

    async fn put_object(&self, key: &str, body: String) -> anyhow::Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(aws_sdk_s3::primitives::ByteStream::from(body.into_bytes()))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!(e.into_service_error()))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(out) => Ok(Some(out.body.collect().await?.into_bytes().to_vec())),
            Err(e) => {
                let svc = e.into_service_error();
                if svc.is_no_such_key() { Ok(None) } else { Err(anyhow::anyhow!(svc)) }
            }
        }
    }
}

#[cfg(feature = "s3")]
#[async_trait]
impl StatusStore for S3StatusStore {
    async fn put_status(&self, scan_id: &str, record: &ScanRecord) -> anyhow::Result<()> {
        self.put_object(&status_key(scan_id), serde_json::to_string(record)?).await
    }
    async fn get_status(&self, scan_id: &str) -> anyhow::Result<Option<ScanRecord>> {
        match self.get_object(&status_key(scan_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
    async fn put_report(&self, scan_id: &str, report: &Value) -> anyhow::Result<()> {
        self.put_object(&report_key(scan_id), serde_json::to_string_pretty(report)?).await
    }
    async fn get_report(&self, scan_id: &str) -> anyhow::Result<Option<Value>> {
        match self.get_object(&report_key(scan_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
    async fn head_report(&self, scan_id: &str) -> anyhow::Result<bool> {
        match self.client.head_object().bucket(&self.bucket).key(report_key(scan_id)).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let svc = e.into_service_error();
                if svc.is_not_found() { Ok(false) } else { Err(anyhow::anyhow!(svc)) }
            }
        }
    }
    async fn ensure_prefixes(&self) -> anyhow::Result<()> {
        for prefix in ["scan-status/", "scan-reports/"] {
            let key = format!("{prefix}placeholder.txt");
            let exists = match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
                Ok(_) => true,
                Err(e) => {
                    let svc = e.into_service_error();
                    if svc.is_not_found() { false } else { return Err(anyhow::anyhow!(svc)); }
                }
            };
            if !exists {
                self.put_object(&key, String::new()).await?;
                info!(prefix, "created store prefix");
            }
        }
        Ok(())
    }
}

/// Select a store backend from the environment: `ARGUS_STORAGE_MODE=s3`
/// for the real bucket (requires the `s3` feature), anything else for the
/// in-memory backend.
pub async fn store_from_env(bucket: &str) -> std::sync::Arc<dyn StatusStore> {
    let mode = std::env::var("ARGUS_STORAGE_MODE").unwrap_or_else(|_| "memory".into());
    if mode.eq_ignore_ascii_case("s3") {
        #[cfg(feature = "s3")]
        {
            return std::sync::Arc::new(S3StatusStore::from_env(bucket).await);
        }
        #[cfg(not(feature = "s3"))]
        warn!("s3 feature not enabled, falling back to in-memory store");
    }
    info!(mode = %mode, bucket = %bucket, "status store: in-memory backend");
    std::sync::Arc::new(MemoryStatusStore::new())
}
