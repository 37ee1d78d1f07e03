// Tests for performance, quality and feedback metrics

use tempfile::TempDir;
use workflow_ledger::db::repositories::{
    CodeAnalysis, FeedbackDecision, NewAnalysis, NewFeedback, NewPerformanceMetric,
    NewRepository, NewSuggestion, NewWorkflow, QualityCategory, Suggestion, SuggestionType,
};
use workflow_ledger::{Store, StoreError};

async fn setup() -> (Store, CodeAnalysis, Suggestion, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::open(temp_dir.path().join("test.db")).unwrap();

    let repo = store
        .repositories
        .create(NewRepository::new("https://github.com/acme/widgets", "widgets", "acme"))
        .await
        .unwrap();
    store.workflows.create(NewWorkflow::new(&repo.id, "wf-1")).await.unwrap();
    let analysis = store.analyses.create(NewAnalysis::new(&repo.id, "src/lib.rs")).await.unwrap();
    let suggestion = store
        .suggestions
        .create(NewSuggestion::new(&analysis.id, SuggestionType::BugFix, "Fix", "Off by one"))
        .await
        .unwrap();
    (store, analysis, suggestion, temp_dir)
}

#[tokio::test]
async fn test_feedback_score_out_of_range() {
    let (store, _analysis, suggestion, _temp) = setup().await;

    let err = store
        .metrics
        .record_feedback(NewFeedback::new(&suggestion.id, FeedbackDecision::Accept, "human", 1.5))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidScore { field: "score", .. }));

    let err = store
        .metrics
        .record_feedback(NewFeedback::new(&suggestion.id, FeedbackDecision::Accept, "human", f64::NAN))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidScore { .. }));

    assert!(store.metrics.feedback_for_suggestion(&suggestion.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_feedback_mean_score() {
    let (store, _analysis, suggestion, _temp) = setup().await;

    assert_eq!(store.metrics.mean_feedback_score(&suggestion.id).await.unwrap(), None);

    store
        .metrics
        .record_feedback(
            NewFeedback::new(&suggestion.id, FeedbackDecision::Accept, "human", 1.0)
                .reasoning("Correct fix"),
        )
        .await
        .unwrap();
    store
        .metrics
        .record_feedback(NewFeedback::new(&suggestion.id, FeedbackDecision::Modify, "tests", 0.5))
        .await
        .unwrap();

    let feedback = store.metrics.feedback_for_suggestion(&suggestion.id).await.unwrap();
    assert_eq!(feedback.len(), 2);
    assert_eq!(feedback[0].reasoning.as_deref(), Some("Correct fix"));
    assert_eq!(feedback[1].decision, FeedbackDecision::Modify);
    assert_eq!(store.metrics.mean_feedback_score(&suggestion.id).await.unwrap(), Some(0.75));

    // Feedback never rewrites the suggestion itself
    let unchanged = store.suggestions.get(&suggestion.id).await.unwrap().unwrap();
    assert_eq!(unchanged, suggestion);
}

#[tokio::test]
async fn test_unknown_parents() {
    let (store, _analysis, _suggestion, _temp) = setup().await;

    let err = store
        .metrics
        .record_metric(NewPerformanceMetric::new("wf-x", "analyze", 10))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownParent { parent: "workflow", .. }));

    let err = store
        .metrics
        .record_quality_metric("missing", "cyclomatic", 3.0, QualityCategory::Complexity)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownParent { parent: "analysis", .. }));

    let err = store
        .metrics
        .record_feedback(NewFeedback::new("missing", FeedbackDecision::Reject, "human", 0.0))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownParent { parent: "suggestion", .. }));
}

#[tokio::test]
async fn test_performance_summary() {
    let (store, _analysis, _suggestion, _temp) = setup().await;

    store
        .metrics
        .record_metric(NewPerformanceMetric::new("wf-1", "analyze", 100).agent("analyzer").usage(2, 500))
        .await
        .unwrap();
    store
        .metrics
        .record_metric(NewPerformanceMetric::new("wf-1", "analyze", 300).agent("analyzer").usage(1, 700))
        .await
        .unwrap();
    store
        .metrics
        .record_metric(NewPerformanceMetric::new("wf-1", "review", 50).failed("model timeout"))
        .await
        .unwrap();

    let analyze = store.metrics.metrics_for_workflow("wf-1", Some("analyze")).await.unwrap();
    assert_eq!(analyze.len(), 2);
    assert!(analyze[0].seq < analyze[1].seq);

    let summary = store.metrics.performance_summary("wf-1").await.unwrap();
    assert_eq!(summary.total_duration_ms, 450);
    assert_eq!(summary.total_api_calls, 3);
    assert_eq!(summary.total_tokens, 1200);
    assert_eq!(summary.operations.len(), 2);
    assert_eq!(summary.operations[0].operation, "analyze");
    assert_eq!(summary.operations[0].avg_duration_ms, 200.0);
    assert_eq!(summary.operations[0].max_duration_ms, 300);
    assert_eq!(summary.operations[1].failures, 1);

    let rate = summary.success_rate.unwrap();
    assert!((rate - 2.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_quality_metrics_by_category() {
    let (store, analysis, _suggestion, _temp) = setup().await;

    store
        .metrics
        .record_quality_metric(&analysis.id, "cyclomatic", 7.0, QualityCategory::Complexity)
        .await
        .unwrap();
    store
        .metrics
        .record_quality_metric(&analysis.id, "unsafe_blocks", 0.0, QualityCategory::Security)
        .await
        .unwrap();

    let all = store.metrics.quality_metrics(&analysis.id, None).await.unwrap();
    assert_eq!(all.len(), 2);

    let security = store
        .metrics
        .quality_metrics(&analysis.id, Some(QualityCategory::Security))
        .await
        .unwrap();
    assert_eq!(security.len(), 1);
    assert_eq!(security[0].metric_name, "unsafe_blocks");

    // Recording metrics leaves the analysis row alone
    let unchanged = store.analyses.get(&analysis.id).await.unwrap().unwrap();
    assert_eq!(unchanged.updated_at, analysis.updated_at);
    assert_eq!(unchanged.complexity_score, None);
}
