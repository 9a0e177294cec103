use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{RetryPolicy, Settings};
use crate::error::ScanError;
use crate::helm::{ChartDeployer, DeployRequest};
use crate::k8s::{JobScheduler, PodObservation, PodPhase};
use crate::models::{resolve_flags, FlagSetting, ScanConfigMap, ScanRecord, ScanStatus};
use crate::storage::{report_key, StatusStore};
use crate::summarizer::{SummarizeError, Summarizer};
use crate::telemetry::{SCANS_COMPLETED, SCANS_FAILED, SCANS_STARTED};

/// Async sleep seam. Production uses the tokio timer; tests inject a no-op
/// so retry-boundary cases run without wall-clock waits.
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) { tokio::time::sleep(duration).await }
}

pub struct NoopSleeper;

#[async_trait]
impl Sleeper for NoopSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Orchestrator knobs, split out of `Settings` so tests can construct them
/// directly with tiny retry budgets.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub namespace: String,
    pub chart_path: PathBuf,
    pub registration: RetryPolicy,
    pub pod_lookup: RetryPolicy,
    pub completion: RetryPolicy,
    pub max_concurrent_scans: usize,
}

impl From<&Settings> for OrchestratorConfig {
    fn from(s: &Settings) -> Self {
        Self {
            namespace: s.namespace.clone(),
            chart_path: s.chart_path.clone(),
            registration: s.registration,
            pod_lookup: s.pod_lookup,
            completion: s.completion,
            max_concurrent_scans: s.max_concurrent_scans,
        }
    }
}

/// Everything the detached execution task needs; owned, so the task borrows
/// nothing from the request that spawned it.
#[derive(Debug, Clone)]
struct ScanContext {
    scan_id: String,
    tool: String,
    mode: String,
    job_name: String,
    release_name: String,
    flags: Vec<FlagSetting>,
}

/// Owns the scan lifecycle: id generation, status initialization, the
/// detached polling state machine, best-effort summarization, and terminal
/// status writes. All collaborators are injected; the orchestrator keeps no
/// per-scan state in process; the store is the single source of truth.
/// Cloning is shallow; clones share every collaborator.
#[derive(Clone)]
pub struct ScanOrchestrator {
    store: Arc<dyn StatusStore>,
    scheduler: Arc<dyn JobScheduler>,
    deployer: Arc<dyn ChartDeployer>,
    summarizer: Arc<dyn Summarizer>,
    config: OrchestratorConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl ScanOrchestrator {
    pub fn new(
        store: Arc<dyn StatusStore>,
        scheduler: Arc<dyn JobScheduler>,
        deployer: Arc<dyn ChartDeployer>,
        summarizer: Arc<dyn Summarizer>,
        config: OrchestratorConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self { store, scheduler, deployer, summarizer, config, sleeper }
    }

    /// Admission control: reject new scans while the namespace is at its
    /// concurrency ceiling. Scheduler errors fail open: a flaky API server
    /// should not block scan intake.
    pub async fn check_capacity(&self) -> Result<(), ScanError> {
        let ceiling = self.config.max_concurrent_scans;
        if ceiling == 0 {
            return Ok(());
        }
        match self.scheduler.active_jobs().await {
            Ok(active) if active >= ceiling => {
                crate::telemetry::SCANS_REJECTED_CAPACITY.inc();
                Err(ScanError::Capacity(ceiling))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "capacity check failed; admitting scan");
                Ok(())
            }
        }
    }

    /// Start a scan: validate the environment and flag config, durably
    /// record `initiated`, then hand off to a detached task. Returns as soon
    /// as the initial status write lands; all scheduler interaction happens
    /// asynchronously.
    pub async fn start_scan(
        &self,
        tool: &str,
        mode: &str,
        config: &ScanConfigMap,
    ) -> Result<ScanRecord, ScanError> {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let unique = Uuid::new_v4().simple().to_string();
        let scan_id = format!("{timestamp}-{}", &unique[..8]);
        let job_name = format!("{mode}-job-{scan_id}");
        let release_name = format!("{mode}-{scan_id}");

        if !self.config.chart_path.exists() {
            return Err(ScanError::Environment(format!(
                "chart path not found: {}",
                self.config.chart_path.display()
            )));
        }
        let flags = resolve_flags(config).map_err(ScanError::Configuration)?;

        let record = ScanRecord::new(&scan_id, tool, mode, &job_name, &release_name, &self.config.namespace);
        // The one status write that must succeed: without it the scan id
        // handed back to the caller would point at nothing.
        self.store
            .put_status(&scan_id, &record)
            .await
            .map_err(|e| ScanError::StoreWrite(e.to_string()))?;
        info!(scan_id = %scan_id, job_name = %job_name, tool, mode, "scan initiated");
        SCANS_STARTED.inc();

        let ctx = ScanContext {
            scan_id: scan_id.clone(),
            tool: tool.to_string(),
            mode: mode.to_string(),
            job_name,
            release_name,
            flags,
        };
        let this = self.clone();
        let handle = tokio::spawn(async move { this.execute_scan(ctx).await });
        // Completion observer: diagnostic logging only, never caller-visible.
        tokio::spawn(async move {
            if let Err(join_err) = handle.await {
                error!(scan_id = %scan_id, error = %join_err, "scan task aborted");
            }
        });

        Ok(record)
    }

    /// Drive the scan state machine to a terminal state. The outer boundary
    /// here is the catch-all required by the lifecycle contract: no error
    /// may escape the detached task, so every failure ends as a `failed`
    /// status write plus a log line.
    async fn execute_scan(&self, ctx: ScanContext) {
        info!(scan_id = %ctx.scan_id, job_name = %ctx.job_name, "scan execution started");
        match self.drive(&ctx).await {
            Ok(analysis_note) => {
                self.update_status(&ctx, ScanStatus::Completed, analysis_note).await;
                SCANS_COMPLETED.inc();
                info!(scan_id = %ctx.scan_id, "scan completed");
            }
            Err(e) => {
                error!(scan_id = %ctx.scan_id, job_name = %ctx.job_name, error = %e, "scan execution failed");
                self.update_status(&ctx, ScanStatus::Failed, Some(e.to_string())).await;
                SCANS_FAILED.inc();
            }
        }
    }

    /// The sequential pipeline: running write, chart deploy, registration
    /// wait, completion wait, post-processing. Returns the post-processing
    /// note (if any) to attach to the `completed` record.
    async fn drive(&self, ctx: &ScanContext) -> Result<Option<String>, ScanError> {
        self.update_status(ctx, ScanStatus::Running, None).await;

        let req = DeployRequest {
            release_name: ctx.release_name.clone(),
            chart_path: self.config.chart_path.clone(),
            namespace: self.config.namespace.clone(),
            job_name: ctx.job_name.clone(),
            scan_id: ctx.scan_id.clone(),
            tool: ctx.tool.clone(),
            mode: ctx.mode.clone(),
            flags: ctx.flags.clone(),
        };
        self.deployer
            .deploy(&req)
            .await
            .map_err(|e| ScanError::Deploy(e.to_string()))?;

        self.wait_for_job_registration(&ctx.job_name).await?;
        self.wait_for_job_completion(ctx).await?;
        Ok(self.run_post_processing(&ctx.tool, &ctx.scan_id).await)
    }

    /// Job admission and job execution have very different latencies, so
    /// the two waits stay separate: this one only answers "does the job
    /// object exist yet". A 404 is "not yet"; any other scheduler error is
    /// fatal.
    async fn wait_for_job_registration(&self, job_name: &str) -> Result<(), ScanError> {
        let policy = self.config.registration;
        for attempt in 1..=policy.max_retries {
            match self.scheduler.job_exists(job_name).await {
                Ok(true) => {
                    info!(job_name, attempt, "job registered in kubernetes");
                    return Ok(());
                }
                Ok(false) => debug!(job_name, attempt, "job not yet registered"),
                Err(e) => return Err(ScanError::Scheduler(e.to_string())),
            }
            self.sleeper.sleep(policy.delay).await;
        }
        Err(ScanError::Registration { job_name: job_name.to_string(), attempts: policy.max_retries })
    }

    /// Wait for a pod to be created for the job. Short-circuits when the
    /// pod is observed in `Unknown` state; `Failed` pods are returned so the
    /// completion wait can attach their logs to the failure.
    async fn wait_for_pod(&self, job_name: &str) -> Result<PodObservation, ScanError> {
        let policy = self.config.pod_lookup;
        for attempt in 1..=policy.max_retries {
            match self
                .scheduler
                .pod_for_job(job_name)
                .await
                .map_err(|e| ScanError::Scheduler(e.to_string()))?
            {
                Some(pod) => match pod.phase {
                    PodPhase::Running | PodPhase::Succeeded | PodPhase::Failed => return Ok(pod),
                    PodPhase::Unknown => {
                        return Err(ScanError::PodFailed {
                            pod: pod.name,
                            phase: pod.phase.as_str().to_string(),
                        })
                    }
                    PodPhase::Pending => debug!(job_name, pod = %pod.name, attempt, "pod pending"),
                },
                None => debug!(job_name, attempt, "pod not found yet"),
            }
            self.sleeper.sleep(policy.delay).await;
        }
        Err(ScanError::PodLookup { job_name: job_name.to_string(), attempts: policy.max_retries })
    }

    /// Poll the scan pod until it reaches a terminal phase, then verify the
    /// success marker in its logs. A terminal pod without the marker, even
    /// one reporting `Succeeded`, is a failure, with the logs attached for
    /// diagnosis.
    async fn wait_for_job_completion(&self, ctx: &ScanContext) -> Result<(), ScanError> {
        let policy = self.config.completion;
        let marker = format!(
            "Scan completed successfully. Report saved at {}",
            report_key(&ctx.scan_id)
        );
        for attempt in 1..=policy.max_retries {
            let pod = self.wait_for_pod(&ctx.job_name).await?;
            if pod.phase.is_terminal() {
                let logs = self
                    .scheduler
                    .pod_logs(&pod.name)
                    .await
                    .map_err(|e| ScanError::Scheduler(e.to_string()))?;
                if logs.contains(&marker) {
                    info!(scan_id = %ctx.scan_id, job_name = %ctx.job_name, "scan report generated");
                    // Settle window: the report object may trail the log line.
                    self.sleeper.sleep(Duration::from_secs(2)).await;
                    return Ok(());
                }
                return Err(ScanError::ExecutionFailed {
                    message: format!("job '{}' finished without producing a report", ctx.job_name),
                    logs,
                });
            }
            debug!(scan_id = %ctx.scan_id, attempt, phase = pod.phase.as_str(), "job still running");
            self.sleeper.sleep(policy.delay).await;
        }
        Err(ScanError::JobTimeout { job_name: ctx.job_name.clone(), attempts: policy.max_retries })
    }

    /// Best-effort AI analysis of the finished report. Exactly one
    /// read-modify-write: if `ai_analysis` is already present the report is
    /// left untouched. Returns a note for the completed record when the
    /// analysis could not be attached; the scan itself still completes.
    pub async fn run_post_processing(&self, tool: &str, scan_id: &str) -> Option<String> {
        let report = match self.store.get_report(scan_id).await {
            Ok(Some(report)) => report,
            Ok(None) => {
                info!(scan_id, "report not found; skipping ai analysis");
                return None;
            }
            Err(e) => {
                warn!(scan_id, error = %e, "failed to fetch report for ai analysis");
                return Some(format!("analysis unavailable: {e}"));
            }
        };
        if report.get("ai_analysis").is_some() {
            info!(scan_id, "ai analysis already present; skipping");
            return None;
        }
        let serialized = match serde_json::to_string_pretty(&report) {
            Ok(s) => s,
            Err(e) => {
                warn!(scan_id, error = %e, "report is not serializable for ai analysis");
                return Some(format!("analysis unavailable: {e}"));
            }
        };
        match self.summarizer.summarize(&serialized).await {
            Ok(analysis) => {
                let mut updated = report;
                match updated.as_object_mut() {
                    Some(obj) => {
                        obj.insert("ai_analysis".to_string(), Value::String(analysis));
                    }
                    None => {
                        warn!(scan_id, "report is not a JSON object; cannot attach ai analysis");
                        return Some("analysis unavailable: report is not a JSON object".to_string());
                    }
                }
                if let Err(e) = self.store.put_report(scan_id, &updated).await {
                    warn!(scan_id, error = %e, "failed to write report with ai analysis");
                    return Some(format!("analysis unavailable: {e}"));
                }
                info!(tool, scan_id, "ai analysis attached to report");
                None
            }
            Err(SummarizeError::Disabled) => {
                debug!(scan_id, "summarizer disabled; skipping ai analysis");
                None
            }
            Err(e) => {
                warn!(scan_id, error = %e, "ai analysis failed");
                Some(format!("analysis unavailable: {e}"))
            }
        }
    }

    /// Best-effort read-modify-write of the status record. Transitions are
    /// monotonic: a record already in a different terminal state is left
    /// alone. Write failures after the initial `initiated` write are logged,
    /// never propagated; they must not mask the scan's real outcome.
    async fn update_status(&self, ctx: &ScanContext, status: ScanStatus, error: Option<String>) {
        let mut record = match self.store.get_status(&ctx.scan_id).await {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                // The initiated record can be invisible under eventual
                // consistency; reconstruct it rather than dropping the write.
                ScanRecord::new(
                    &ctx.scan_id,
                    &ctx.tool,
                    &ctx.mode,
                    &ctx.job_name,
                    &ctx.release_name,
                    &self.config.namespace,
                )
            }
            Err(e) => {
                warn!(scan_id = %ctx.scan_id, error = %e, "status read failed; rebuilding record");
                ScanRecord::new(
                    &ctx.scan_id,
                    &ctx.tool,
                    &ctx.mode,
                    &ctx.job_name,
                    &ctx.release_name,
                    &self.config.namespace,
                )
            }
        };
        if !record.transition(status, error) {
            warn!(scan_id = %ctx.scan_id, current = record.status.as_str(), attempted = status.as_str(), "ignoring status regression");
            return;
        }
        if let Err(e) = self.store.put_status(&ctx.scan_id, &record).await {
            warn!(scan_id = %ctx.scan_id, status = status.as_str(), error = %e, "status update failed");
        }
    }
}
