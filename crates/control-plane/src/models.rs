use serde::{Serialize, Deserialize};
use utoipa::ToSchema;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Lifecycle states of a scan. Transitions are monotonic:
/// `initiated -> running -> completed | failed`; terminal states are never
/// overwritten. `Unknown` absorbs any status value written by a future
/// version so polling clients keep getting a readable answer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Initiated,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool { matches!(self, ScanStatus::Completed | ScanStatus::Failed) }
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Initiated => "initiated",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Unknown => "unknown",
        }
    }
}

/// Tracking document for one scan execution, persisted under
/// `scan-status/{scan_id}.json`. Written only by the orchestrator and the
/// self-healing status query path.
#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct ScanRecord {
    pub scan_id: String,
    pub tool: String,
    pub mode: String,
    pub job_name: String,
    pub release_name: String,
    pub namespace: String,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanRecord {
    pub fn new(scan_id: &str, tool: &str, mode: &str, job_name: &str, release_name: &str, namespace: &str) -> Self {
        let now = Utc::now();
        Self {
            scan_id: scan_id.to_string(),
            tool: tool.to_string(),
            mode: mode.to_string(),
            job_name: job_name.to_string(),
            release_name: release_name.to_string(),
            namespace: namespace.to_string(),
            status: ScanStatus::Initiated,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Apply a status transition. Returns false (and leaves the record
    /// untouched) when the record is already in a different terminal state.
    pub fn transition(&mut self, next: ScanStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() && next != self.status {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        if error.is_some() {
            self.error = error;
        }
        true
    }
}

/// Per-flag scan configuration as submitted by the client, matching the
/// `scan_config.json` shape: `{enabled, flag, env_var, value, mandatory, type}`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, ToSchema)]
pub struct FlagConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub flag: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub mandatory: Option<bool>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

/// BTreeMap keeps flag iteration (and therefore the generated helm
/// arguments) deterministic.
pub type ScanConfigMap = BTreeMap<String, FlagConfig>;

/// Validated deploy parameter derived from one `FlagConfig`. Produced once
/// at the request boundary; consumed by the helm argument builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagSetting {
    pub name: String,
    pub cli_flag: bool,
    /// `(env var name, value)` pair when the flag carries a runtime value.
    pub env_var: Option<(String, String)>,
}

/// Translate the raw config map into validated deploy settings.
///
/// Rules carried over from the scan job contract:
/// - entries with `type == "dynamic"` get their value from the chart template
///   and are skipped here;
/// - entries without an explicit `enabled` field are incomplete and skipped
///   with a warning;
/// - an enabled flag that names an `env_var` but carries no value is a hard
///   configuration error.
pub fn resolve_flags(config: &ScanConfigMap) -> Result<Vec<FlagSetting>, String> {
    let mut settings = Vec::new();
    for (name, cfg) in config {
        if cfg.kind.as_deref() == Some("dynamic") {
            continue;
        }
        let Some(enabled) = cfg.enabled else {
            tracing::warn!(flag = %name, "flag is missing the 'enabled' field; skipping");
            continue;
        };
        if !enabled {
            continue;
        }
        let cli_flag = cfg.flag.as_deref().is_some_and(|f| !f.is_empty());
        let env_var = match cfg.env_var.as_deref() {
            Some(var) if !var.is_empty() => match &cfg.value {
                Some(v) if !v.is_null() => Some((var.to_string(), value_as_string(v))),
                _ => return Err(format!("missing required value for enabled flag: {name}")),
            },
            _ => None,
        };
        if cli_flag || env_var.is_some() {
            settings.push(FlagSetting { name: name.clone(), cli_flag, env_var });
        }
    }
    Ok(settings)
}

fn value_as_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Client-facing view of a scan, reconciled from the store and the live
/// scheduler state.
#[derive(Serialize, Debug, Clone, ToSchema)]
pub struct StatusView {
    pub scan_id: String,
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub report: Option<serde_json::Value>,
}

impl StatusView {
    pub fn bare(scan_id: &str, status: &str, message: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            status: status.to_string(),
            message: message.into(),
            job_status: None,
            error: None,
            report: None,
        }
    }
}
