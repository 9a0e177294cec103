use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt, api::{ListParams, LogParams}};
use tracing::info;

/// Pod lifecycle phase as reported by the scheduler. `Error` status strings
/// map to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" | "Error" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool { matches!(self, PodPhase::Succeeded | PodPhase::Failed) }

    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub name: String,
    pub phase: PodPhase,
}

/// Completion counters from the job object's status block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobState {
    pub active: i32,
    pub succeeded: i32,
    pub failed: i32,
}

impl JobState {
    pub fn finished(&self) -> bool { self.succeeded > 0 || self.failed > 0 }
}

/// Read-only view of the cluster scheduler scoped to one namespace. A 404
/// from the API server is a legitimate "not yet" signal during registration
/// polling, so lookups return `Option` instead of failing.
#[async_trait]
pub trait JobScheduler: Send + Sync + 'static {
    async fn job_exists(&self, job_name: &str) -> Result<bool>;
    async fn job_state(&self, job_name: &str) -> Result<Option<JobState>>;
    /// First pod matching the job's `job-name` label selector.
    async fn pod_for_job(&self, job_name: &str) -> Result<Option<PodObservation>>;
    async fn pod_logs(&self, pod_name: &str) -> Result<String>;
    /// Count of unfinished jobs in the namespace, for admission control.
    async fn active_jobs(&self) -> Result<usize>;
}

pub struct KubeScheduler {
    client: Client,
    namespace: String,
}

impl KubeScheduler {
    pub async fn try_default(namespace: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        info!(namespace, "kubernetes client initialized");
        Ok(Self { client, namespace: namespace.to_string() })
    }

    fn jobs(&self) -> Api<Job> { Api::namespaced(self.client.clone(), &self.namespace) }
    fn pods(&self) -> Api<Pod> { Api::namespaced(self.client.clone(), &self.namespace) }
}

#[async_trait]
impl JobScheduler for KubeScheduler {
    async fn job_exists(&self, job_name: &str) -> Result<bool> {
        Ok(self.jobs().get_opt(job_name).await?.is_some())
    }

    async fn job_state(&self, job_name: &str) -> Result<Option<JobState>> {
        let Some(job) = self.jobs().get_opt(job_name).await? else { return Ok(None) };
        let state = job.status.map(|s| JobState {
            active: s.active.unwrap_or(0),
            succeeded: s.succeeded.unwrap_or(0),
            failed: s.failed.unwrap_or(0),
        });
        Ok(Some(state.unwrap_or_default()))
    }

    async fn pod_for_job(&self, job_name: &str) -> Result<Option<PodObservation>> {
        let params = ListParams::default().labels(&format!("job-name={job_name}"));
        let pods = self.pods().list(&params).await?;
        Ok(pods.items.into_iter().next().map(|pod| {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(PodPhase::parse)
                .unwrap_or(PodPhase::Unknown);
            PodObservation { name: pod.name_any(), phase }
        }))
    }

    async fn pod_logs(&self, pod_name: &str) -> Result<String> {
        Ok(self.pods().logs(pod_name, &LogParams::default()).await?)
    }

    async fn active_jobs(&self) -> Result<usize> {
        let jobs = self.jobs().list(&ListParams::default()).await?;
        Ok(jobs
            .items
            .iter()
            .filter(|job| {
                let state = job.status.as_ref().map(|s| JobState {
                    active: s.active.unwrap_or(0),
                    succeeded: s.succeeded.unwrap_or(0),
                    failed: s.failed.unwrap_or(0),
                });
                !state.unwrap_or_default().finished()
            })
            .count())
    }
}
