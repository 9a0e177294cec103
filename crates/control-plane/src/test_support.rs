//! Shared fakes for unit and integration tests. Every orchestrator
//! collaborator has a scriptable stand-in so lifecycle tests run with no
//! cluster, no helm binary, and no wall-clock waits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::helm::{ChartDeployer, DeployError, DeployRequest};
use crate::k8s::{JobScheduler, JobState, PodObservation, PodPhase};
use crate::services::{NoopSleeper, OrchestratorConfig, ScanOrchestrator};
use crate::storage::MemoryStatusStore;
use crate::summarizer::{SummarizeError, Summarizer};

#[derive(Default)]
struct SchedulerScript {
    registered: Vec<String>,
    /// job name -> number of `job_exists` calls that still return false.
    register_misses: HashMap<String, u32>,
    job_states: HashMap<String, JobState>,
    /// job name -> observation sequence; the last entry repeats.
    pods: HashMap<String, Vec<Option<PodObservation>>>,
    logs: HashMap<String, String>,
    active: usize,
    fail_with: Option<String>,
    auto_succeed: bool,
}

/// Scriptable `JobScheduler`.
#[derive(Default)]
pub struct FakeScheduler {
    script: Mutex<SchedulerScript>,
}

impl FakeScheduler {
    pub fn new() -> Self { Self::default() }

    pub fn register_job(&self, job_name: &str) {
        self.script.lock().unwrap().registered.push(job_name.to_string());
    }

    /// Job appears only after `misses` failed existence checks.
    pub fn register_job_after(&self, job_name: &str, misses: u32) {
        let mut script = self.script.lock().unwrap();
        script.registered.push(job_name.to_string());
        script.register_misses.insert(job_name.to_string(), misses);
    }

    pub fn set_job_state(&self, job_name: &str, state: JobState) {
        self.script.lock().unwrap().job_states.insert(job_name.to_string(), state);
    }

    /// Queue the pod observations returned by successive `pod_for_job`
    /// calls; `None` entries model "no pod yet".
    pub fn set_pod_sequence(&self, job_name: &str, sequence: Vec<Option<PodObservation>>) {
        self.script.lock().unwrap().pods.insert(job_name.to_string(), sequence);
    }

    pub fn set_pod(&self, job_name: &str, pod_name: &str, phase: PodPhase) {
        self.set_pod_sequence(
            job_name,
            vec![Some(PodObservation { name: pod_name.to_string(), phase })],
        );
    }

    pub fn set_logs(&self, pod_name: &str, logs: &str) {
        self.script.lock().unwrap().logs.insert(pod_name.to_string(), logs.to_string());
    }

    pub fn set_active_jobs(&self, active: usize) {
        self.script.lock().unwrap().active = active;
    }

    /// Make every call return the given error.
    pub fn fail_with(&self, message: &str) {
        self.script.lock().unwrap().fail_with = Some(message.to_string());
    }

    /// Every job registers immediately, gets a succeeded pod named
    /// `pod-{job_name}`, and that pod's logs carry the success marker for
    /// the job's scan id. Lets tests script a happy path before the job
    /// name is known.
    pub fn auto_succeed(&self) {
        self.script.lock().unwrap().auto_succeed = true;
    }

    fn check_failure(script: &SchedulerScript) -> anyhow::Result<()> {
        match &script.fail_with {
            Some(msg) => Err(anyhow::anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobScheduler for FakeScheduler {
    async fn job_exists(&self, job_name: &str) -> anyhow::Result<bool> {
        let mut script = self.script.lock().unwrap();
        Self::check_failure(&script)?;
        if script.auto_succeed {
            return Ok(true);
        }
        if let Some(misses) = script.register_misses.get_mut(job_name) {
            if *misses > 0 {
                *misses -= 1;
                return Ok(false);
            }
        }
        Ok(script.registered.iter().any(|j| j == job_name))
    }

    async fn job_state(&self, job_name: &str) -> anyhow::Result<Option<JobState>> {
        let script = self.script.lock().unwrap();
        Self::check_failure(&script)?;
        Ok(script.job_states.get(job_name).copied())
    }

    async fn pod_for_job(&self, job_name: &str) -> anyhow::Result<Option<PodObservation>> {
        let mut script = self.script.lock().unwrap();
        Self::check_failure(&script)?;
        if script.auto_succeed {
            return Ok(Some(PodObservation {
                name: format!("pod-{job_name}"),
                phase: PodPhase::Succeeded,
            }));
        }
        let Some(sequence) = script.pods.get_mut(job_name) else { return Ok(None) };
        if sequence.is_empty() {
            return Ok(None);
        }
        if sequence.len() > 1 {
            Ok(sequence.remove(0))
        } else {
            Ok(sequence[0].clone())
        }
    }

    async fn pod_logs(&self, pod_name: &str) -> anyhow::Result<String> {
        let script = self.script.lock().unwrap();
        Self::check_failure(&script)?;
        if script.auto_succeed {
            // Pod name is `pod-{mode}-job-{scan_id}`; recover the scan id to
            // emit the matching success marker.
            if let Some((_, scan_id)) = pod_name.split_once("-job-") {
                return Ok(success_logs(scan_id));
            }
        }
        Ok(script.logs.get(pod_name).cloned().unwrap_or_default())
    }

    async fn active_jobs(&self) -> anyhow::Result<usize> {
        let script = self.script.lock().unwrap();
        Self::check_failure(&script)?;
        Ok(script.active)
    }
}

/// Records deploy requests instead of shelling out to helm.
#[derive(Default)]
pub struct FakeDeployer {
    requests: Mutex<Vec<DeployRequest>>,
    fail_with: Mutex<Option<String>>,
}

impl FakeDeployer {
    pub fn new() -> Self { Self::default() }

    pub fn requests(&self) -> Vec<DeployRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fail_with(&self, stderr: &str) {
        *self.fail_with.lock().unwrap() = Some(stderr.to_string());
    }
}

#[async_trait]
impl ChartDeployer for FakeDeployer {
    async fn deploy(&self, req: &DeployRequest) -> Result<(), DeployError> {
        self.requests.lock().unwrap().push(req.clone());
        match self.fail_with.lock().unwrap().clone() {
            Some(stderr) => Err(DeployError::Failed { stderr }),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub enum FakeAnalysis {
    Text(String),
    Disabled,
    Fail(String),
}

/// Scriptable `Summarizer` that records every report it was handed.
pub struct FakeSummarizer {
    reply: Mutex<FakeAnalysis>,
    calls: Mutex<Vec<String>>,
}

impl FakeSummarizer {
    pub fn replying(text: &str) -> Self {
        Self { reply: Mutex::new(FakeAnalysis::Text(text.to_string())), calls: Mutex::new(Vec::new()) }
    }

    pub fn disabled() -> Self {
        Self { reply: Mutex::new(FakeAnalysis::Disabled), calls: Mutex::new(Vec::new()) }
    }

    pub fn failing(message: &str) -> Self {
        Self { reply: Mutex::new(FakeAnalysis::Fail(message.to_string())), calls: Mutex::new(Vec::new()) }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Summarizer for FakeSummarizer {
    async fn summarize(&self, report_json: &str) -> Result<String, SummarizeError> {
        self.calls.lock().unwrap().push(report_json.to_string());
        match self.reply.lock().unwrap().clone() {
            FakeAnalysis::Text(text) => Ok(text),
            FakeAnalysis::Disabled => Err(SummarizeError::Disabled),
            FakeAnalysis::Fail(message) => Err(SummarizeError::Request(message)),
        }
    }
}

/// Orchestrator wired to fakes, with tiny retry budgets and a no-op
/// sleeper so the whole lifecycle runs in microseconds.
pub struct Harness {
    pub store: Arc<MemoryStatusStore>,
    pub scheduler: Arc<FakeScheduler>,
    pub deployer: Arc<FakeDeployer>,
    pub summarizer: Arc<FakeSummarizer>,
    pub orchestrator: Arc<ScanOrchestrator>,
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        namespace: "default".to_string(),
        // Points at the workspace so the chart-path existence check passes.
        chart_path: PathBuf::from("."),
        registration: RetryPolicy::new(3, Duration::ZERO),
        pod_lookup: RetryPolicy::new(3, Duration::ZERO),
        completion: RetryPolicy::new(5, Duration::ZERO),
        max_concurrent_scans: 5,
    }
}

pub fn harness() -> Harness {
    harness_with(test_config(), FakeSummarizer::disabled())
}

pub fn harness_with(config: OrchestratorConfig, summarizer: FakeSummarizer) -> Harness {
    let store = Arc::new(MemoryStatusStore::new());
    let scheduler = Arc::new(FakeScheduler::new());
    let deployer = Arc::new(FakeDeployer::new());
    let summarizer = Arc::new(summarizer);
    let orchestrator = Arc::new(ScanOrchestrator::new(
        store.clone(),
        scheduler.clone(),
        deployer.clone(),
        summarizer.clone(),
        config,
        Arc::new(NoopSleeper),
    ));
    Harness { store, scheduler, deployer, summarizer, orchestrator }
}

/// Standard success marker line written by the scan job container.
pub fn success_logs(scan_id: &str) -> String {
    format!(
        "2025-01-01 12:00:00 starting scan\nScan completed successfully. Report saved at scan-reports/{scan_id}.json\n"
    )
}
