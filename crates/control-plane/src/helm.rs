use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::models::FlagSetting;

/// One chart instantiation: everything `helm install` needs to materialize
/// a scan job for a single scan id.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    pub release_name: String,
    pub chart_path: PathBuf,
    pub namespace: String,
    pub job_name: String,
    pub scan_id: String,
    pub tool: String,
    pub mode: String,
    pub flags: Vec<FlagSetting>,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("helm install failed: {stderr}")]
    Failed { stderr: String },
    #[error("helm install timed out after {0:?}")]
    TimedOut(Duration),
    #[error("failed to run helm: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Build the `helm install` argument vector. Only flags validated at the
/// request boundary reach this point; the translation itself is pure so the
/// exact CLI contract stays unit-testable.
pub fn helm_args(req: &DeployRequest) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        req.release_name.clone(),
        req.chart_path.display().to_string(),
        "--namespace".to_string(),
        req.namespace.clone(),
        "--set".to_string(),
        "scan_settings.zapScanJobEnabled=true".to_string(),
        "--set".to_string(),
        format!("job.name={}", req.job_name),
        "--set".to_string(),
        format!("job.scanid={}", req.scan_id),
        "--set".to_string(),
        format!("scan_settings.scanMode={}", req.mode),
        "--set".to_string(),
        format!("scan_settings.scanTool={}", req.tool),
    ];
    for flag in &req.flags {
        if flag.cli_flag {
            args.push(format!(
                "--set=scan_settings.{}.{}.flags.{}=true",
                req.tool, req.mode, flag.name
            ));
        }
        if let Some((var, value)) = &flag.env_var {
            args.push(format!(
                "--set=scan_settings.{}.{}.values.{}={}",
                req.tool, req.mode, var, value
            ));
        }
    }
    args
}

#[async_trait]
pub trait ChartDeployer: Send + Sync + 'static {
    async fn deploy(&self, req: &DeployRequest) -> Result<(), DeployError>;
}

/// Shells out to the `helm` binary. The subprocess gets a hard timeout so a
/// wedged install can never stall the polling loops of unrelated scans.
pub struct HelmCli {
    pub timeout: Duration,
}

impl HelmCli {
    pub fn new(timeout: Duration) -> Self { Self { timeout } }
}

#[async_trait]
impl ChartDeployer for HelmCli {
    async fn deploy(&self, req: &DeployRequest) -> Result<(), DeployError> {
        let args = helm_args(req);
        debug!(release = %req.release_name, "helm {}", args.join(" "));
        let output = tokio::time::timeout(self.timeout, Command::new("helm").args(&args).output())
            .await
            .map_err(|_| DeployError::TimedOut(self.timeout))??;
        if !output.status.success() {
            return Err(DeployError::Failed {
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        info!(release = %req.release_name, job = %req.job_name, "helm release triggered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> DeployRequest {
        DeployRequest {
            release_name: "baseline-20250101120000-abcd1234".into(),
            chart_path: PathBuf::from("./zap-scan-job"),
            namespace: "default".into(),
            job_name: "baseline-job-20250101120000-abcd1234".into(),
            scan_id: "20250101120000-abcd1234".into(),
            tool: "owasp".into(),
            mode: "baseline".into(),
            flags: vec![],
        }
    }

    #[test]
    fn args_carry_release_chart_and_identity() {
        let args = helm_args(&base_request());
        assert_eq!(args[0], "install");
        assert_eq!(args[1], "baseline-20250101120000-abcd1234");
        assert_eq!(args[2], "./zap-scan-job");
        assert!(args.contains(&"--namespace".to_string()));
        assert!(args.contains(&"job.name=baseline-job-20250101120000-abcd1234".to_string()));
        assert!(args.contains(&"job.scanid=20250101120000-abcd1234".to_string()));
        assert!(args.contains(&"scan_settings.scanMode=baseline".to_string()));
        assert!(args.contains(&"scan_settings.scanTool=owasp".to_string()));
        assert!(args.contains(&"scan_settings.zapScanJobEnabled=true".to_string()));
    }

    #[test]
    fn enabled_flag_becomes_set_argument() {
        let mut req = base_request();
        req.flags = vec![FlagSetting { name: "ENABLE_DEBUG".into(), cli_flag: true, env_var: None }];
        let args = helm_args(&req);
        assert!(args.contains(&"--set=scan_settings.owasp.baseline.flags.ENABLE_DEBUG=true".to_string()));
    }

    #[test]
    fn env_var_value_becomes_values_argument() {
        let mut req = base_request();
        req.flags = vec![FlagSetting {
            name: "TARGET".into(),
            cli_flag: true,
            env_var: Some(("TARGET_URL".into(), "https://example.test".into())),
        }];
        let args = helm_args(&req);
        assert!(args.contains(&"--set=scan_settings.owasp.baseline.flags.TARGET=true".to_string()));
        assert!(args.contains(&"--set=scan_settings.owasp.baseline.values.TARGET_URL=https://example.test".to_string()));
    }

    #[test]
    fn flag_without_cli_switch_emits_only_values() {
        let mut req = base_request();
        req.flags = vec![FlagSetting {
            name: "AUTH".into(),
            cli_flag: false,
            env_var: Some(("AUTH_TOKEN".into(), "secret".into())),
        }];
        let args = helm_args(&req);
        assert!(!args.iter().any(|a| a.contains("flags.AUTH")));
        assert!(args.contains(&"--set=scan_settings.owasp.baseline.values.AUTH_TOKEN=secret".to_string()));
    }
}
