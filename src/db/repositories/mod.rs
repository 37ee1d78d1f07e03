//! Per-entity stores over the shared connection pool

pub mod analysis;
pub mod audit;
pub mod metrics;
pub mod repository;
pub mod suggestion;
pub mod summary;
pub mod workflow;

pub use analysis::{AnalysisStatus, AnalysisStore, AnalysisUpdate, CodeAnalysis, NewAnalysis};
pub use audit::{
    AgentInteraction, AuditLog, ContextSnapshot, ContextType, InteractionQuery, InteractionType,
    NewInteraction, SnapshotQuery,
};
pub use metrics::{
    FeedbackDecision, MetricsCollector, NewFeedback, NewPerformanceMetric, PerformanceMetric,
    PerformanceSummary, QualityCategory, QualityMetric, SuggestionFeedback,
};
pub use repository::{CloneStatus, NewRepository, Repository, RepositoryStore, RepositoryUpdate};
pub use suggestion::{
    NewSuggestion, Suggestion, SuggestionStatus, SuggestionStore, SuggestionType, SuggestionUpdate,
};
pub use summary::{RepositorySummary, SuggestionSummary, SummaryViews, WorkflowSummary};
pub use workflow::{ErrorEntry, NewWorkflow, WorkflowState, WorkflowStatus, WorkflowStore};
