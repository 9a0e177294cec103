use std::sync::Arc;
use tracing::{info, warn};

use crate::k8s::JobScheduler;
use crate::models::{ScanRecord, ScanStatus, StatusView};
use crate::storage::StatusStore;

/// Read side of the scan lifecycle: reconciles the stored status record
/// with live scheduler state and serves the client-facing view. The store
/// stays authoritative; the scheduler is only consulted for scans that are
/// not yet terminal.
pub struct StatusService {
    store: Arc<dyn StatusStore>,
    scheduler: Arc<dyn JobScheduler>,
}

impl StatusService {
    pub fn new(store: Arc<dyn StatusStore>, scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Readiness probe: one store read must succeed. NotFound is a healthy
    /// answer; only transport or auth failures mark the instance unready.
    pub async fn probe(&self) -> anyhow::Result<()> {
        self.store.get_status("readiness-probe").await.map(|_| ())
    }

    /// Resolve the current view of a scan. `None` means no record exists
    /// for the id. The query itself never fails: a store outage is reported
    /// inside the view as `status: "error"` so polling clients keep getting
    /// an answer they can render.
    pub async fn get_scan_status(&self, scan_id: &str) -> Option<StatusView> {
        let record = match self.store.get_status(scan_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(scan_id, error = %e, "status read failed");
                let mut view = StatusView::bare(scan_id, "error", "Failed to retrieve scan status.");
                view.error = Some(e.to_string());
                return Some(view);
            }
        };
        let view = match record.status {
            ScanStatus::Completed => self.completed_view(&record).await,
            ScanStatus::Failed => {
                let mut view = StatusView::bare(scan_id, "failed", "Scan failed.");
                view.error = record.error;
                view
            }
            ScanStatus::Unknown => {
                StatusView::bare(scan_id, "unknown", "Scan is in an unrecognized state; retry later.")
            }
            ScanStatus::Initiated | ScanStatus::Running => self.in_flight_view(record).await,
        };
        Some(view)
    }

    async fn completed_view(&self, record: &ScanRecord) -> StatusView {
        let report = match self.store.get_report(&record.scan_id).await {
            Ok(report) => report,
            Err(e) => {
                warn!(scan_id = %record.scan_id, error = %e, "report fetch failed for completed scan");
                None
            }
        };
        let message = if report.is_some() {
            "Scan completed successfully."
        } else {
            "Scan completed but report not found."
        };
        let mut view = StatusView::bare(&record.scan_id, "completed", message);
        view.error = record.error.clone();
        view.report = report;
        view
    }

    /// Cross-check a non-terminal record against the live job. A failed job
    /// with a stale record means the detached execution task died before its
    /// terminal write; the record is healed here so clients stop polling a
    /// scan that can never finish.
    async fn in_flight_view(&self, record: ScanRecord) -> StatusView {
        let scan_id = record.scan_id.clone();
        let stored = record.status.as_str();
        match self.scheduler.job_state(&record.job_name).await {
            Ok(Some(state)) if state.succeeded > 0 => {
                // The job is done but the terminal write has not landed yet;
                // the report is still being generated and attached.
                let mut view =
                    StatusView::bare(&scan_id, "processing", "Scan completed, generating report.");
                view.job_status = Some("succeeded".into());
                view
            }
            Ok(Some(state)) if state.failed > 0 => {
                self.heal_failed_record(record).await;
                let mut view = StatusView::bare(&scan_id, "failed", "Scan job failed.");
                view.job_status = Some("failed".into());
                view.error = Some("scan job reported failure".into());
                view
            }
            Ok(Some(state)) if state.active > 0 => {
                let mut view = StatusView::bare(&scan_id, stored, "Scan in progress.");
                view.job_status = Some("active".into());
                view
            }
            Ok(Some(_)) => {
                let mut view = StatusView::bare(&scan_id, stored, "Scan job is pending.");
                view.job_status = Some("pending".into());
                view
            }
            Ok(None) => StatusView::bare(&scan_id, stored, "Scan job is not yet registered."),
            Err(e) => {
                // Degrade to the stored record rather than failing the query.
                warn!(scan_id = %scan_id, error = %e, "scheduler lookup failed during status query");
                StatusView::bare(&scan_id, stored, "Scan in progress; cluster state unavailable.")
            }
        }
    }

    async fn heal_failed_record(&self, mut record: ScanRecord) {
        let scan_id = record.scan_id.clone();
        if !record.transition(ScanStatus::Failed, Some("scan job reported failure".into())) {
            return;
        }
        match self.store.put_status(&scan_id, &record).await {
            Ok(()) => info!(scan_id = %scan_id, "healed stale status record for failed job"),
            Err(e) => warn!(scan_id = %scan_id, error = %e, "failed to heal stale status record"),
        }
    }
}
