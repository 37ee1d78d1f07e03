// Tests for the entity store

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;
use workflow_ledger::db::repositories::{
    AnalysisStatus, AnalysisUpdate, CloneStatus, NewAnalysis, NewRepository, NewSuggestion,
    NewWorkflow, RepositoryUpdate, SuggestionStatus, SuggestionType, SuggestionUpdate,
};
use workflow_ledger::db::{Database, ManualClock, PoolOptions, SystemClock};
use workflow_ledger::{Store, StoreError};

fn create_test_store() -> (Store, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(temp_dir.path().join("test.db")).unwrap();
    (store, temp_dir)
}

fn create_clocked_store() -> (Store, Arc<ManualClock>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
    let db = Database::open_with(temp_dir.path().join("test.db"), PoolOptions::default(), clock.clone()).unwrap();
    (Store::new(db), clock, temp_dir)
}

#[tokio::test]
async fn test_database_initialization() {
    let (store, _temp) = create_test_store();
    assert!(store.db.path().contains("test.db"));
    assert!(store.db.health_check().await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_exhaustion_is_retryable() {
    let temp_dir = TempDir::new().unwrap();
    let options = PoolOptions {
        max_size: 1,
        busy_timeout_ms: 100,
        connection_timeout_secs: 1,
    };
    let db = Database::open_with(temp_dir.path().join("test.db"), options, Arc::new(SystemClock)).unwrap();

    // Hold the only connection past the checkout timeout
    let holder = db.clone();
    let held = tokio::spawn(async move {
        holder
            .write(|_, _| {
                std::thread::sleep(std::time::Duration::from_millis(2_500));
                Ok(())
            })
            .await
    });
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let err = db
        .read(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TransactionConflict(_)));
    assert!(err.is_retryable());

    held.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_create_repository() {
    let (store, _temp) = create_test_store();

    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();

    assert!(!repo.id.is_empty());
    assert_eq!(repo.branch, "main");
    assert_eq!(repo.clone_status, CloneStatus::Pending);
    assert_eq!(repo.created_at, repo.updated_at);

    let fetched = store.repositories.get(&repo.id).await.unwrap().unwrap();
    assert_eq!(fetched, repo);

    let by_url = store
        .repositories
        .get_by_url("https://github.com/acme/widgets")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_url.id, repo.id);

    let by_name = store.repositories.get_by_owner_name("acme", "widgets").await.unwrap().unwrap();
    assert_eq!(by_name.id, repo.id);
}

#[tokio::test]
async fn test_duplicate_repository_url() {
    let (store, _temp) = create_test_store();
    let new = NewRepository::new("https://github.com/acme/widgets", "widgets", "acme");

    store.repositories.create(new.clone()).await.unwrap();
    let err = store.repositories.create(new).await.unwrap_err();

    assert!(matches!(err, StoreError::DuplicateKey { entity: "repository", .. }));
    assert_eq!(store.repositories.list(10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_touches_once_and_empty_update_does_not_touch() {
    let (store, clock, _temp) = create_clocked_store();
    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();

    clock.advance(Duration::seconds(5));
    let untouched = store.repositories.update(&repo.id, RepositoryUpdate::default()).await.unwrap();
    assert_eq!(untouched.updated_at, repo.updated_at);

    clock.advance(Duration::seconds(5));
    let updated = store
        .repositories
        .update(
            &repo.id,
            RepositoryUpdate {
                description: Some("Widget factory".to_string()),
                language: Some("rust".to_string()),
                file_count: Some(42),
                complexity_summary: Some(json!({"mean": 3.2})),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.updated_at, repo.created_at + Duration::seconds(10));
    assert_eq!(updated.created_at, repo.created_at);
    assert_eq!(updated.description.as_deref(), Some("Widget factory"));
    assert_eq!(updated.file_count, Some(42));
    assert_eq!(updated.complexity_summary, Some(json!({"mean": 3.2})));
}

#[tokio::test]
async fn test_clone_status_and_mark_analyzed() {
    let (store, _temp) = create_test_store();
    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();

    let ready = store
        .repositories
        .update_clone_status(&repo.id, CloneStatus::Ready, Some("/tmp/widgets".to_string()))
        .await
        .unwrap();
    assert_eq!(ready.clone_status, CloneStatus::Ready);
    assert_eq!(ready.local_path.as_deref(), Some("/tmp/widgets"));

    assert!(store.repositories.recently_analyzed(10).await.unwrap().is_empty());
    let analyzed = store.repositories.mark_analyzed(&repo.id).await.unwrap();
    assert!(analyzed.last_analyzed.is_some());
    assert_eq!(store.repositories.recently_analyzed(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_update_and_delete_missing_repository() {
    let (store, _temp) = create_test_store();

    let err = store
        .repositories
        .update(
            "missing",
            RepositoryUpdate {
                name: Some("x".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    let err = store.repositories.delete("missing").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn test_repository_delete_cascades() {
    let (store, _temp) = create_test_store();
    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();
    let wf = store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    let analysis = store.analyses.create(NewAnalysis::new(&repo.id, "src/lib.rs")).await.unwrap();
    let suggestion = store
        .suggestions
        .create(NewSuggestion::new(&analysis.id, SuggestionType::BugFix, "Fix", "Off by one"))
        .await
        .unwrap();

    store.repositories.delete(&repo.id).await.unwrap();

    assert!(store.repositories.get(&repo.id).await.unwrap().is_none());
    assert!(store.analyses.get(&analysis.id).await.unwrap().is_none());
    assert!(store.suggestions.get(&suggestion.id).await.unwrap().is_none());
    assert!(store.workflows.get(&wf.id).await.unwrap().is_none());

    let leftovers: i64 = store
        .db
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT (SELECT COUNT(*) FROM code_analyses) + (SELECT COUNT(*) FROM suggestions)
                      + (SELECT COUNT(*) FROM workflow_states)",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_analysis_lifecycle() {
    let (store, _temp) = create_test_store();
    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();

    let analysis = store.analyses.create(NewAnalysis::new(&repo.id, "src/main.rs")).await.unwrap();
    assert_eq!(analysis.status, AnalysisStatus::Pending);
    assert!(analysis.workflow_state_id.is_none());

    let err = store
        .analyses
        .create(NewAnalysis::new(&repo.id, "src/main.rs"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey { entity: "analysis", .. }));

    let err = store
        .analyses
        .set_status(&analysis.id, AnalysisStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    store.analyses.set_status(&analysis.id, AnalysisStatus::Running).await.unwrap();
    let updated = store
        .analyses
        .update(
            &analysis.id,
            AnalysisUpdate {
                lines_of_code: Some(120),
                complexity_score: Some(4.0),
                quality_score: Some(0.8),
                functions: Some(json!(["main"])),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.lines_of_code, Some(120));

    let done = store.analyses.set_status(&analysis.id, AnalysisStatus::Completed).await.unwrap();
    assert_eq!(done.status, AnalysisStatus::Completed);

    let err = store
        .analyses
        .update(
            &analysis.id,
            AnalysisUpdate {
                summary: Some("late".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Immutable { .. }));

    let stats = store.analyses.summary_stats(&repo.id).await.unwrap();
    assert_eq!(stats.total_files, 1);
    assert_eq!(stats.by_status.get("completed"), Some(&1));
    assert_eq!(stats.avg_complexity, Some(4.0));

    let found = store.analyses.get_by_path(&repo.id, "src/main.rs").await.unwrap().unwrap();
    assert_eq!(found.id, analysis.id);
}

#[tokio::test]
async fn test_analysis_requires_repository() {
    let (store, _temp) = create_test_store();
    let err = store
        .analyses
        .create(NewAnalysis::new("no-such-repo", "src/main.rs"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ForeignKeyViolation(_)));
}

#[tokio::test]
async fn test_failed_analyses_listed_for_retry() {
    let (store, _temp) = create_test_store();
    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();
    let a = store.analyses.create(NewAnalysis::new(&repo.id, "a.rs")).await.unwrap();
    store.analyses.create(NewAnalysis::new(&repo.id, "b.rs")).await.unwrap();
    store.analyses.set_status(&a.id, AnalysisStatus::Failed).await.unwrap();

    let failed = store.analyses.failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].file_path, "a.rs");

    let pending = store
        .analyses
        .list_by_repository(&repo.id, Some(AnalysisStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn test_suggestion_review_flow() {
    let (store, _temp) = create_test_store();
    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();
    let analysis = store.analyses.create(NewAnalysis::new(&repo.id, "src/lib.rs")).await.unwrap();

    let mut new = NewSuggestion::new(&analysis.id, SuggestionType::Optimization, "Cache", "Memoize lookup");
    new.confidence_score = Some(0.9);
    let suggestion = store.suggestions.create(new).await.unwrap();
    assert_eq!(suggestion.status, SuggestionStatus::Generated);
    assert!(suggestion.reviewed_at.is_none());

    let reviewed = store
        .suggestions
        .set_status(&suggestion.id, SuggestionStatus::Approved, Some("Looks right".to_string()))
        .await
        .unwrap();
    assert_eq!(reviewed.status, SuggestionStatus::Approved);
    assert_eq!(reviewed.feedback.as_deref(), Some("Looks right"));
    assert!(reviewed.reviewed_at.is_some());

    let applied = store
        .suggestions
        .set_status(&suggestion.id, SuggestionStatus::Applied, None)
        .await
        .unwrap();
    assert_eq!(applied.reviewed_at, reviewed.reviewed_at);

    let err = store
        .suggestions
        .update(
            &suggestion.id,
            SuggestionUpdate {
                title: Some("Changed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Immutable { .. }));

    let err = store
        .suggestions
        .set_status(&suggestion.id, SuggestionStatus::Rejected, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Immutable { .. }));

    assert_eq!(store.suggestions.high_confidence(0.8).await.unwrap().len(), 1);
    assert_eq!(store.suggestions.list_by_repository(&repo.id).await.unwrap().len(), 1);
    assert_eq!(
        store
            .suggestions
            .list_by_type(SuggestionType::Optimization, Some(SuggestionStatus::Applied))
            .await
            .unwrap()
            .len(),
        1
    );

    let stats = store.suggestions.statistics().await.unwrap();
    assert_eq!(stats.total_suggestions, 1);
    assert_eq!(stats.by_type_and_status[0].status, "applied");
}

#[tokio::test]
async fn test_suggestion_scores_and_parent() {
    let (store, _temp) = create_test_store();
    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();
    let analysis = store.analyses.create(NewAnalysis::new(&repo.id, "src/lib.rs")).await.unwrap();

    let mut new = NewSuggestion::new(&analysis.id, SuggestionType::BugFix, "Fix", "Bad score");
    new.impact_score = Some(1.2);
    let err = store.suggestions.create(new).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidScore { field: "impact_score", .. }));

    let err = store
        .suggestions
        .create(NewSuggestion::new("missing", SuggestionType::BugFix, "Fix", "Orphan"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ForeignKeyViolation(_)));

    let suggestion = store
        .suggestions
        .create(NewSuggestion::new(&analysis.id, SuggestionType::BugFix, "Fix", "Fine"))
        .await
        .unwrap();
    let err = store
        .suggestions
        .set_status(&suggestion.id, SuggestionStatus::Applied, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    store.suggestions.delete(&suggestion.id).await.unwrap();
    let err = store.suggestions.delete(&suggestion.id).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}
