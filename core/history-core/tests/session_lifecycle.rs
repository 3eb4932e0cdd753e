//! Integration tests for the session lifecycle across service restarts.

use history_core::{
    ActionStatus, HistoryError, HistoryService, RestoreOutcome, RestoreReport, StorageConfig,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn setup() -> (TempDir, PathBuf) {
    let temp = TempDir::new().unwrap();
    let project = temp.path().join("workspace");
    std::fs::create_dir_all(&project).unwrap();
    (temp, project)
}

fn service(temp: &TempDir, project: &Path) -> HistoryService {
    HistoryService::new(
        project,
        StorageConfig::with_roots(temp.path().join("install/sessions"), temp.path().join("mirror")),
    )
}

#[test]
fn test_prompt_goals_and_progress_flow() {
    let (temp, project) = setup();
    let service = service(&temp, &project);
    service.initialize_session(Some("Amazon Q")).unwrap();

    service
        .log_prompt("The goal is a streaming parser. It must handle 1GB files. Avoid unsafe code.")
        .unwrap();

    let progress = service.check_progress().unwrap();
    assert_eq!(progress.remaining.len(), 2);
    assert_eq!(progress.completion_percentage, 0);

    service
        .mark_criteria_complete(0, Some("parser streams input".into()))
        .unwrap();
    let progress = service.check_progress().unwrap();
    assert_eq!(progress.completion_percentage, 50);

    assert!(matches!(
        service.mark_criteria_complete(7, None),
        Err(HistoryError::CriteriaIndexOutOfRange { .. })
    ));
}

#[test]
fn test_worklog_summary_round_trip() {
    let (temp, project) = setup();
    let service = service(&temp, &project);
    service.initialize_session(None).unwrap();

    let logged = service
        .log_action("Add tokenizer", &["src/tokenizer.rs".into()], ActionStatus::Success)
        .unwrap();
    service
        .log_action("Run benchmarks", &[], ActionStatus::Failed)
        .unwrap();

    let worklog = service.get_worklog().unwrap();
    assert_eq!(worklog.actions[0], logged);
    assert_eq!(worklog.summary.success_rate, 50);
    assert_eq!(worklog.summary.unique_files_modified, 1);

    let report = service.progress_report().unwrap();
    assert_eq!(report.recent_actions.len(), 2);

    let context = service.get_recent_context(5, 1).unwrap();
    assert_eq!(context.recent_actions.len(), 1);
    assert_eq!(context.total_actions, 2);
}

#[test]
fn test_recovery_after_primary_loss() {
    let (temp, project) = setup();
    let session = {
        let service = service(&temp, &project);
        let session = service.initialize_session(None).unwrap();
        service.log_prompt("Migrate the config loader").unwrap();
        session
    };
    std::fs::remove_dir_all(&session.storage_path).unwrap();

    let restarted = service(&temp, &project);
    match restarted.restore_from_backup(None).unwrap() {
        RestoreOutcome::Listing { sessions } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].summary, "Migrate the config loader");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    match restarted.restore_from_backup(Some(&session.id)).unwrap() {
        RestoreOutcome::Report(RestoreReport::Restored { files, .. }) => assert_eq!(files.len(), 5),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(restarted.get_history().unwrap().prompts.len(), 1);

    assert!(matches!(
        restarted.restore_from_backup(Some(&session.id)).unwrap(),
        RestoreOutcome::Report(RestoreReport::AlreadyPresent { .. })
    ));
}

#[test]
fn test_restore_unknown_session_creates_nothing() {
    let (temp, project) = setup();
    let service = service(&temp, &project);
    let err = service
        .restore_from_backup(Some("2026-01-01T00-00-00_amazon-q_00000000"))
        .unwrap_err();
    assert_eq!(err.code(), "restore_not_found");
    assert!(!temp.path().join("install/sessions").exists());
}

#[test]
fn test_health_reports_queue_counts() {
    let (temp, project) = setup();
    let service = service(&temp, &project);
    service.initialize_session(None).unwrap();
    service.log_action("One", &[], ActionStatus::Success).unwrap();

    let health = service.health();
    assert!(health.active_session.is_some());
    assert!(health.queue.submitted >= 2);
    assert_eq!(health.queue.pending, 0);
}
