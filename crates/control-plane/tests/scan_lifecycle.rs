//! End-to-end lifecycle tests for the scan orchestrator, driven entirely
//! through fakes. Tests run on the current-thread runtime, so the detached
//! execution task only progresses at the test's own await points; scripting
//! the scheduler right after `start_scan` returns is race-free.

use std::collections::BTreeMap;
use std::time::Duration;

use control_plane::error::ScanError;
use control_plane::k8s::PodPhase;
use control_plane::models::{FlagConfig, ScanRecord, ScanStatus};
use control_plane::storage::{report_key, status_key, MemoryStatusStore, StatusStore};
use control_plane::test_support::{harness, harness_with, success_logs, test_config, FakeSummarizer, Harness};

async fn wait_for_terminal(store: &MemoryStatusStore, scan_id: &str) -> ScanRecord {
    for _ in 0..500 {
        if let Some(record) = store.get_status(scan_id).await.unwrap() {
            if record.status.is_terminal() {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("scan {scan_id} never reached a terminal status");
}

fn status_sequence(store: &MemoryStatusStore, scan_id: &str) -> Vec<String> {
    store
        .writes()
        .into_iter()
        .filter(|(key, _)| *key == status_key(scan_id))
        .map(|(_, body)| {
            let v: serde_json::Value = serde_json::from_str(&body).unwrap();
            v["status"].as_str().unwrap().to_string()
        })
        .collect()
}

fn script_success(h: &Harness, record: &ScanRecord) {
    h.scheduler.register_job(&record.job_name);
    h.scheduler.set_pod(&record.job_name, "scan-pod", PodPhase::Succeeded);
    h.scheduler.set_logs("scan-pod", &success_logs(&record.scan_id));
}

#[tokio::test]
async fn successful_scan_runs_to_completed() {
    let h = harness();
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    assert_eq!(record.status, ScanStatus::Initiated);
    assert_eq!(record.job_name, format!("baseline-job-{}", record.scan_id));
    assert_eq!(record.release_name, format!("baseline-{}", record.scan_id));
    script_success(&h, &record);

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Completed);
    assert_eq!(done.error, None);
    assert_eq!(
        status_sequence(&h.store, &record.scan_id),
        vec!["initiated", "running", "completed"]
    );

    let deploys = h.deployer.requests();
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].release_name, record.release_name);
    assert_eq!(deploys[0].job_name, record.job_name);
    assert_eq!(deploys[0].namespace, "default");
    assert_eq!(deploys[0].scan_id, record.scan_id);
}

#[tokio::test]
async fn scan_id_embeds_timestamp_and_suffix() {
    let h = harness();
    let record = h.orchestrator.start_scan("owasp", "fullscan", &BTreeMap::new()).await.unwrap();
    let (ts, suffix) = record.scan_id.split_once('-').unwrap();
    assert_eq!(ts.len(), 14);
    assert!(ts.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(suffix.len(), 8);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn missing_chart_path_is_rejected_before_any_state_exists() {
    let mut config = test_config();
    config.chart_path = std::path::PathBuf::from("./no-such-chart");
    let h = harness_with(config, FakeSummarizer::disabled());
    let err = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, ScanError::Environment(_)));
    assert!(h.store.writes().is_empty());
    assert!(h.deployer.requests().is_empty());
}

#[tokio::test]
async fn deploy_failure_marks_scan_failed() {
    let h = harness();
    h.deployer.fail_with("chart not found");
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Failed);
    let error = done.error.unwrap();
    assert!(error.contains("chart not found"), "unexpected error: {error}");
    // The deploy happens after the running write, so the failure path still
    // passed through running first.
    assert_eq!(status_sequence(&h.store, &record.scan_id), vec!["initiated", "running", "failed"]);
}

#[tokio::test]
async fn unregistered_job_fails_after_retry_budget() {
    let h = harness();
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    // Scheduler never sees the job.
    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Failed);
    assert!(done.error.unwrap().contains("was not registered"));
}

#[tokio::test]
async fn late_registration_within_budget_succeeds() {
    let h = harness();
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    h.scheduler.register_job_after(&record.job_name, 2);
    h.scheduler.set_pod(&record.job_name, "scan-pod", PodPhase::Succeeded);
    h.scheduler.set_logs("scan-pod", &success_logs(&record.scan_id));

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Completed);
}

#[tokio::test]
async fn registration_one_attempt_past_the_budget_fails() {
    let h = harness();
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    // Budget is 3 attempts; the job would only appear on the 4th.
    h.scheduler.register_job_after(&record.job_name, 3);

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Failed);
    assert!(done.error.unwrap().contains("was not registered"));
}

#[tokio::test]
async fn missing_pod_fails_after_retry_budget() {
    let h = harness();
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    h.scheduler.register_job(&record.job_name);

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Failed);
    assert!(done.error.unwrap().contains("no pod found"));
}

#[tokio::test]
async fn pending_pod_is_retried_until_terminal() {
    let h = harness();
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    h.scheduler.register_job(&record.job_name);
    h.scheduler.set_pod_sequence(
        &record.job_name,
        vec![
            None,
            Some(control_plane::k8s::PodObservation { name: "scan-pod".into(), phase: PodPhase::Pending }),
            Some(control_plane::k8s::PodObservation { name: "scan-pod".into(), phase: PodPhase::Running }),
            Some(control_plane::k8s::PodObservation { name: "scan-pod".into(), phase: PodPhase::Succeeded }),
        ],
    );
    h.scheduler.set_logs("scan-pod", &success_logs(&record.scan_id));

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Completed);
}

#[tokio::test]
async fn terminal_pod_without_marker_fails_with_logs_attached() {
    let h = harness();
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    h.scheduler.register_job(&record.job_name);
    h.scheduler.set_pod(&record.job_name, "scan-pod", PodPhase::Failed);
    h.scheduler.set_logs("scan-pod", "zap: target unreachable\n");

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Failed);
    let error = done.error.unwrap();
    assert!(error.contains("finished without producing a report"), "unexpected error: {error}");
    assert!(error.contains("target unreachable"), "pod logs missing from error: {error}");
}

#[tokio::test]
async fn invalid_flag_config_is_rejected_before_any_state_exists() {
    let h = harness();
    let mut config = BTreeMap::new();
    config.insert(
        "AUTH_TOKEN".to_string(),
        FlagConfig {
            enabled: Some(true),
            env_var: Some("AUTH_TOKEN".to_string()),
            ..FlagConfig::default()
        },
    );
    let err = h.orchestrator.start_scan("owasp", "baseline", &config).await.unwrap_err();
    assert!(matches!(err, ScanError::Configuration(_)));
    assert!(h.store.writes().is_empty(), "store must stay empty on rejected scans");
    assert!(h.deployer.requests().is_empty(), "no deploy may happen on rejected scans");
}

#[tokio::test]
async fn capacity_ceiling_rejects_new_scans() {
    let h = harness();
    h.scheduler.set_active_jobs(5);
    let err = h.orchestrator.check_capacity().await.unwrap_err();
    assert!(matches!(err, ScanError::Capacity(5)));
}

#[tokio::test]
async fn capacity_check_fails_open_on_scheduler_error() {
    let h = harness();
    h.scheduler.fail_with("apiserver unavailable");
    assert!(h.orchestrator.check_capacity().await.is_ok());
}

#[tokio::test]
async fn completed_scan_gets_ai_analysis_attached() {
    let h = harness_with(test_config(), FakeSummarizer::replying("Two high-risk findings."));
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    script_success(&h, &record);
    h.store
        .put_report(&record.scan_id, &serde_json::json!({"site": [{"alerts": ["xss"]}]}))
        .await
        .unwrap();

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Completed);
    assert_eq!(done.error, None);
    assert_eq!(h.summarizer.calls().len(), 1);
    let report = h.store.get_report(&record.scan_id).await.unwrap().unwrap();
    assert_eq!(report["ai_analysis"], "Two high-risk findings.");
    // Exactly one attach write on top of the test's seed write.
    assert_eq!(h.store.writes_for(&report_key(&record.scan_id)), 2);

    // Rerunning post-processing leaves the stored bytes untouched.
    let before = h.store.raw(&report_key(&record.scan_id)).unwrap();
    let note = h.orchestrator.run_post_processing("owasp", &record.scan_id).await;
    assert_eq!(note, None);
    assert_eq!(h.store.raw(&report_key(&record.scan_id)).unwrap(), before);
    assert_eq!(h.summarizer.calls().len(), 1);
}

#[tokio::test]
async fn existing_analysis_is_not_overwritten() {
    let h = harness_with(test_config(), FakeSummarizer::replying("fresh"));
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    script_success(&h, &record);
    h.store
        .put_report(&record.scan_id, &serde_json::json!({"site": [], "ai_analysis": "original"}))
        .await
        .unwrap();
    let writes_before = h.store.writes_for(&report_key(&record.scan_id));

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Completed);
    assert!(h.summarizer.calls().is_empty());
    assert_eq!(h.store.writes_for(&report_key(&record.scan_id)), writes_before);
    let report = h.store.get_report(&record.scan_id).await.unwrap().unwrap();
    assert_eq!(report["ai_analysis"], "original");
}

#[tokio::test]
async fn analysis_failure_still_completes_the_scan() {
    let h = harness_with(test_config(), FakeSummarizer::failing("model down"));
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    script_success(&h, &record);
    h.store.put_report(&record.scan_id, &serde_json::json!({"site": []})).await.unwrap();

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Completed);
    let note = done.error.unwrap();
    assert!(note.contains("analysis unavailable"), "unexpected note: {note}");
    let report = h.store.get_report(&record.scan_id).await.unwrap().unwrap();
    assert!(report.get("ai_analysis").is_none());
}

#[tokio::test]
async fn missing_report_skips_analysis_quietly() {
    let h = harness_with(test_config(), FakeSummarizer::replying("never used"));
    let record = h.orchestrator.start_scan("owasp", "baseline", &BTreeMap::new()).await.unwrap();
    script_success(&h, &record);

    let done = wait_for_terminal(&h.store, &record.scan_id).await;
    assert_eq!(done.status, ScanStatus::Completed);
    assert_eq!(done.error, None);
    assert!(h.summarizer.calls().is_empty());
}

#[tokio::test]
async fn enabled_flags_reach_the_deployer() {
    let h = harness();
    let mut config = BTreeMap::new();
    config.insert(
        "ENABLE_DEBUG".to_string(),
        FlagConfig { enabled: Some(true), flag: Some("-d".to_string()), ..FlagConfig::default() },
    );
    config.insert(
        "TARGET".to_string(),
        FlagConfig {
            enabled: Some(true),
            flag: Some("-t".to_string()),
            env_var: Some("TARGET_URL".to_string()),
            value: Some(serde_json::json!("https://example.test")),
            ..FlagConfig::default()
        },
    );
    let record = h.orchestrator.start_scan("owasp", "baseline", &config).await.unwrap();
    script_success(&h, &record);
    wait_for_terminal(&h.store, &record.scan_id).await;

    let deploys = h.deployer.requests();
    assert_eq!(deploys.len(), 1);
    let names: Vec<&str> = deploys[0].flags.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["ENABLE_DEBUG", "TARGET"]);
    assert_eq!(
        deploys[0].flags[1].env_var,
        Some(("TARGET_URL".to_string(), "https://example.test".to_string()))
    );
}
