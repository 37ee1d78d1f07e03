// Tests for the workflow state machine and running totals

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;
use workflow_ledger::db::repositories::workflow::duration_seconds;
use workflow_ledger::db::repositories::{
    AnalysisStatus, NewAnalysis, NewRepository, NewSuggestion, NewWorkflow, Repository,
    SuggestionStatus, SuggestionType, WorkflowStatus,
};
use workflow_ledger::db::{Database, ManualClock, PoolOptions};
use workflow_ledger::{Store, StoreError};

fn create_clocked_store() -> (Store, Arc<ManualClock>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
    let db = Database::open_with(temp_dir.path().join("test.db"), PoolOptions::default(), clock.clone()).unwrap();
    (Store::new(db), clock, temp_dir)
}

async fn create_repo(store: &Store) -> Repository {
    store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_second_active_workflow_rejected() {
    let (store, _clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;

    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();

    let err = store.workflows.create(NewWorkflow::new(&repo.id, "wf-2")).await.unwrap_err();
    match err {
        StoreError::WorkflowAlreadyActive { active_workflow, .. } => assert_eq!(active_workflow, "wf-1"),
        other => panic!("unexpected error: {:?}", other),
    }

    // Once wf-1 is terminal a new run may start
    store.workflows.transition("wf-1", WorkflowStatus::Completed).await.unwrap();
    let wf2 = store.workflows.create(NewWorkflow::new(&repo.id, "wf-2")).await.unwrap();
    assert_eq!(wf2.status, WorkflowStatus::Initialized);
    assert_eq!(store.workflows.list_by_repository(&repo.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_duplicate_workflow_id_and_missing_repository() {
    let (store, _clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;

    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Failed).await.unwrap();

    let err = store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey { entity: "workflow", .. }));

    let err = store.workflows.create(NewWorkflow::new("missing", "wf-9")).await.unwrap_err();
    assert!(matches!(err, StoreError::ForeignKeyViolation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_leaves_one_active() {
    let (store, _clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let repo_id = repo.id.clone();
        handles.push(tokio::spawn(async move {
            store.workflows.create(NewWorkflow::new(repo_id, format!("wf-{}", i))).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(StoreError::WorkflowAlreadyActive { .. }) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(created, 1);
    assert_eq!(store.workflows.active().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_initialized_cannot_complete() {
    let (store, _clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;
    let wf = store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();

    let err = store.workflows.transition("wf-1", WorkflowStatus::Completed).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { entity: "workflow", .. }));

    let unchanged = store.workflows.get_by_workflow_id("wf-1").await.unwrap().unwrap();
    assert_eq!(unchanged, wf);
}

#[tokio::test]
async fn test_terminal_states_never_move() {
    let (store, _clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;
    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Paused).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Failed).await.unwrap();

    for target in WorkflowStatus::ALL {
        if *target == WorkflowStatus::Failed {
            continue;
        }
        let err = store.workflows.transition("wf-1", *target).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }
    assert_eq!(store.workflows.failed().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_same_status_transition_does_not_touch() {
    let (store, clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;
    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    let running = store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();

    clock.advance(Duration::seconds(30));
    let again = store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();
    assert_eq!(again.updated_at, running.updated_at);
    assert!(again.end_time.is_none());
}

#[tokio::test]
async fn test_execution_time_matches_timestamps_exactly() {
    let (store, clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;
    let created = store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();

    clock.advance(Duration::seconds(1));
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();
    clock.advance(Duration::microseconds(90_500_250));
    let done = store.workflows.transition("wf-1", WorkflowStatus::Completed).await.unwrap();

    let end = done.end_time.unwrap();
    assert_eq!(done.start_time, created.start_time);
    assert_eq!(done.execution_time_seconds, Some(duration_seconds(done.start_time, end)));
    assert_eq!(done.execution_time_seconds, Some(91.50025));
    assert_eq!(done.progress_percentage, 100.0);

    let stats = store.workflows.statistics().await.unwrap();
    assert_eq!(stats.total_workflows, 1);
    assert_eq!(stats.by_status.get("completed"), Some(&1));
    assert_eq!(stats.avg_execution_times.get("completed"), Some(&91.50025));
}

#[tokio::test]
async fn test_end_time_never_precedes_start() {
    let (store, clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;
    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();

    clock.advance(Duration::seconds(-60));
    let failed = store.workflows.transition("wf-1", WorkflowStatus::Failed).await.unwrap();
    assert_eq!(failed.end_time, Some(failed.start_time));
    assert_eq!(failed.execution_time_seconds, Some(0.0));
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let (store, _clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;
    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();

    let wf = store
        .workflows
        .update_progress("wf-1", 40.0, Some("analysis".to_string()), Some("analyzer".to_string()))
        .await
        .unwrap();
    assert_eq!(wf.progress_percentage, 40.0);
    assert_eq!(wf.current_step.as_deref(), Some("analysis"));
    assert_eq!(wf.current_agent.as_deref(), Some("analyzer"));

    let err = store.workflows.update_progress("wf-1", 30.0, None, None).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidProgress { .. }));

    let wf = store.workflows.update_progress("wf-1", 55.0, None, None).await.unwrap();
    assert_eq!(wf.progress_percentage, 55.0);
    assert_eq!(wf.current_step.as_deref(), Some("analysis"));

    for bad in [f64::NAN, f64::INFINITY, 100.5, -1.0] {
        let err = store.workflows.update_progress("wf-1", bad, None, None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidProgress { .. }));
    }

    store.workflows.transition("wf-1", WorkflowStatus::Completed).await.unwrap();
    let err = store.workflows.update_progress("wf-1", 100.0, None, None).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidProgress { .. }));

    let err = store.workflows.update_progress("wf-missing", 10.0, None, None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn test_error_log_context_and_output() {
    let (store, _clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;
    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();
    store
        .workflows
        .update_progress("wf-1", 10.0, Some("clone".to_string()), Some("cloner".to_string()))
        .await
        .unwrap();

    store.workflows.record_error("wf-1", "network timeout", "clone_error").await.unwrap();
    let wf = store.workflows.record_error("wf-1", "retry failed", "clone_error").await.unwrap();
    let errors = wf.errors();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].message, "network timeout");
    assert_eq!(errors[1].error_type, "clone_error");
    assert_eq!(errors[1].agent.as_deref(), Some("cloner"));
    assert_eq!(errors[1].step.as_deref(), Some("clone"));

    let wf = store
        .workflows
        .set_context("wf-1", json!({"files": ["a.rs"]}))
        .await
        .unwrap();
    assert_eq!(wf.context_data, Some(json!({"files": ["a.rs"]})));

    let wf = store
        .workflows
        .set_output(
            "wf-1",
            Some("ledger/fixes".to_string()),
            Some("https://github.com/acme/widgets/pull/7".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(wf.branch_name.as_deref(), Some("ledger/fixes"));
    assert!(wf.pull_request_url.is_some());
}

#[tokio::test]
async fn test_running_totals_follow_child_rows() {
    let (store, _clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;

    // Queued before any workflow exists, so never counted
    let early = store.analyses.create(NewAnalysis::new(&repo.id, "early.rs")).await.unwrap();
    assert!(early.workflow_state_id.is_none());

    let wf = store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    store.workflows.transition("wf-1", WorkflowStatus::Running).await.unwrap();

    let a = store.analyses.create(NewAnalysis::new(&repo.id, "a.rs")).await.unwrap();
    let b = store.analyses.create(NewAnalysis::new(&repo.id, "b.rs")).await.unwrap();
    assert_eq!(a.workflow_state_id.as_deref(), Some(wf.id.as_str()));

    for analysis in [&a, &b] {
        store.analyses.set_status(&analysis.id, AnalysisStatus::Running).await.unwrap();
    }
    store.analyses.set_status(&a.id, AnalysisStatus::Completed).await.unwrap();
    store.analyses.set_status(&b.id, AnalysisStatus::Failed).await.unwrap();

    let s1 = store
        .suggestions
        .create(NewSuggestion::new(&a.id, SuggestionType::BugFix, "Fix", "Null check"))
        .await
        .unwrap();
    let s2 = store
        .suggestions
        .create(NewSuggestion::new(&a.id, SuggestionType::Refactoring, "Split", "Too long"))
        .await
        .unwrap();
    store
        .suggestions
        .create(NewSuggestion::new(&b.id, SuggestionType::Improvement, "Doc", "Missing docs"))
        .await
        .unwrap();

    store.suggestions.set_status(&s1.id, SuggestionStatus::Approved, None).await.unwrap();
    store.suggestions.set_status(&s1.id, SuggestionStatus::Applied, None).await.unwrap();
    store.suggestions.set_status(&s2.id, SuggestionStatus::Rejected, None).await.unwrap();

    let state = store.workflows.get_by_workflow_id("wf-1").await.unwrap().unwrap();
    assert_eq!(state.total_files_analyzed, 1);
    assert_eq!(state.total_suggestions, 3);
    assert_eq!(state.approved_suggestions, 1);

    let summary = store.summaries.workflow_summary("wf-1").await.unwrap().unwrap();
    assert!(summary.totals_consistent());

    store.suggestions.delete(&s1.id).await.unwrap();
    store.analyses.delete(&b.id).await.unwrap();

    let state = store.workflows.get_by_workflow_id("wf-1").await.unwrap().unwrap();
    assert_eq!(state.total_files_analyzed, 1);
    assert_eq!(state.total_suggestions, 1);
    assert_eq!(state.approved_suggestions, 0);
    assert!(store.summaries.workflow_summary("wf-1").await.unwrap().unwrap().totals_consistent());
}

#[tokio::test]
async fn test_deleting_workflow_unlinks_analyses() {
    let (store, clock, _temp) = create_clocked_store();
    let repo = create_repo(&store).await;
    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    let analysis = store.analyses.create(NewAnalysis::new(&repo.id, "a.rs")).await.unwrap();
    assert!(analysis.workflow_state_id.is_some());

    clock.advance(Duration::seconds(60));
    store.workflows.delete("wf-1").await.unwrap();

    let unlinked = store.analyses.get(&analysis.id).await.unwrap().unwrap();
    assert!(unlinked.workflow_state_id.is_none());
    assert_eq!(unlinked.updated_at, analysis.updated_at + Duration::seconds(60));
    assert_eq!(unlinked.created_at, analysis.created_at);

    let err = store.workflows.delete("wf-1").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}
