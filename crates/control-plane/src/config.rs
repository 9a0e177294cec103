use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::models::FlagConfig;

/// Bounded retry loop parameters. Kept injectable so tests can exercise
/// boundary counts without wall-clock waits.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self { Self { max_retries, delay } }
}

/// Runtime settings, environment-driven with conservative defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub chart_path: PathBuf,
    pub bucket: String,
    /// Wait for the job object to appear after `helm install`.
    pub registration: RetryPolicy,
    /// Wait for a pod to be created for a registered job.
    pub pod_lookup: RetryPolicy,
    /// Wait for the scan pod to reach a terminal phase. Long because scans
    /// are long-running.
    pub completion: RetryPolicy,
    pub helm_timeout: Duration,
    /// Admission-control ceiling; 0 disables the check.
    pub max_concurrent_scans: usize,
    pub model_id: String,
    pub scan_config_path: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            namespace: env_string("ARGUS_NAMESPACE", "default"),
            chart_path: PathBuf::from(env_string("ARGUS_CHART_PATH", "./zap-scan-job")),
            bucket: env_string("ARGUS_SCAN_BUCKET", "scan-artifacts"),
            registration: RetryPolicy::new(
                env_u32("ARGUS_JOB_REGISTRATION_RETRIES", 15),
                Duration::from_secs(env_u64("ARGUS_JOB_REGISTRATION_DELAY_SECS", 5)),
            ),
            pod_lookup: RetryPolicy::new(
                env_u32("ARGUS_JOB_POD_RETRIES", 10),
                Duration::from_secs(env_u64("ARGUS_JOB_POD_DELAY_SECS", 5)),
            ),
            completion: RetryPolicy::new(
                env_u32("ARGUS_JOB_COMPLETION_RETRIES", 60),
                Duration::from_secs(env_u64("ARGUS_JOB_COMPLETION_DELAY_SECS", 10)),
            ),
            helm_timeout: Duration::from_secs(env_u64("ARGUS_HELM_TIMEOUT_SECS", 60)),
            max_concurrent_scans: env_u32("ARGUS_MAX_CONCURRENT_SCANS", 5) as usize,
            model_id: env_string("ARGUS_MODEL_ID", "meta.llama3-1-70b-instruct-v1:0"),
            scan_config_path: PathBuf::from(env_string("ARGUS_SCAN_CONFIG_PATH", "config/scan_config.json")),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Deserialize, Default)]
struct RegistryFile {
    #[serde(default)]
    tools: HashMap<String, ToolEntry>,
}

#[derive(Debug, Deserialize, Default)]
struct ToolEntry {
    #[serde(default)]
    modes: HashMap<String, ModeEntry>,
}

/// Per-mode server-side flag defaults from `scan_config.json`. Kept so a
/// client can be seeded with the mode's flag set via `GET /scan-config`.
#[derive(Debug, Deserialize, Default, Clone)]
struct ModeEntry {
    #[serde(default)]
    config: HashMap<String, FlagConfig>,
}

/// Registry of known scan tools and their modes, loaded from
/// `scan_config.json`. Requests naming a tool or mode outside the registry
/// are rejected at the facade before any scan state is created.
#[derive(Debug, Clone)]
pub struct ScanRegistry {
    tools: HashMap<String, HashMap<String, ModeEntry>>,
}

impl ScanRegistry {
    /// Load from the configured JSON file, falling back to the built-in
    /// defaults when the file is missing or malformed.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<RegistryFile>(&raw) {
                Ok(file) if !file.tools.is_empty() => {
                    let tools: HashMap<_, _> = file.tools.into_iter().map(|(k, v)| (k, v.modes)).collect();
                    info!(path = %path.display(), tools = tools.len(), "scan registry loaded");
                    Self { tools }
                }
                Ok(_) => {
                    warn!(path = %path.display(), "scan registry file declares no tools; using built-in defaults");
                    Self::builtin_default()
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse scan registry; using built-in defaults");
                    Self::builtin_default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "scan registry file not found; using built-in defaults");
                Self::builtin_default()
            }
        }
    }

    pub fn builtin_default() -> Self {
        let mut modes = HashMap::new();
        modes.insert("baseline".to_string(), ModeEntry::default());
        modes.insert("fullscan".to_string(), ModeEntry::default());
        let mut tools = HashMap::new();
        tools.insert("owasp".to_string(), modes);
        Self { tools }
    }

    /// Registry contents as JSON, served to clients that build scan forms
    /// from the available tools, modes, and flag defaults.
    pub fn describe(&self) -> serde_json::Value {
        let mut tools = serde_json::Map::new();
        for (tool, modes) in &self.tools {
            let mut out_modes = serde_json::Map::new();
            for (mode, entry) in modes {
                out_modes.insert(mode.clone(), serde_json::json!({ "config": entry.config }));
            }
            tools.insert(tool.clone(), serde_json::Value::Object(out_modes));
        }
        serde_json::json!({ "tools": tools })
    }

    /// Validate a requested tool/mode pair; the error message lists what is
    /// available so a misconfigured client can self-correct.
    pub fn validate(&self, tool: &str, mode: &str) -> Result<(), String> {
        let Some(modes) = self.tools.get(tool) else {
            let mut available: Vec<_> = self.tools.keys().cloned().collect();
            available.sort();
            return Err(format!("invalid tool '{tool}'; available tools: {available:?}"));
        };
        if !modes.contains_key(mode) {
            let mut available: Vec<_> = modes.keys().cloned().collect();
            available.sort();
            return Err(format!("invalid mode '{mode}' for tool '{tool}'; available modes: {available:?}"));
        }
        Ok(())
    }
}
