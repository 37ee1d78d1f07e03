//! Read-only rollups backed by the SQL views
//!
//! The views are recomputed on every query, so they always agree with the
//! rows underneath them.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::repository::CloneStatus;
use super::suggestion::{SuggestionStatus, SuggestionType};
use super::workflow::WorkflowStatus;
use crate::db::Database;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub repository_id: String,
    pub url: String,
    pub name: String,
    pub owner: String,
    pub clone_status: CloneStatus,
    pub last_analyzed: Option<DateTime<Utc>>,
    pub analyzed_files: i64,
    pub total_suggestions: i64,
    pub avg_complexity: Option<f64>,
    pub avg_quality: Option<f64>,
    pub last_analysis_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_state_id: String,
    pub workflow_id: String,
    pub repository_id: String,
    pub repository_name: String,
    pub repository_owner: String,
    pub repository_url: String,
    pub status: WorkflowStatus,
    /// `success`, `failed` or `running`
    pub execution_status: String,
    pub current_agent: Option<String>,
    pub current_step: Option<String>,
    pub progress_percentage: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time_seconds: Option<f64>,
    pub total_files_analyzed: i64,
    pub total_suggestions: i64,
    pub approved_suggestions: i64,
    pub derived_files_analyzed: i64,
    pub derived_suggestions: i64,
    pub derived_approved: i64,
    pub branch_name: Option<String>,
    pub pull_request_url: Option<String>,
}

impl WorkflowSummary {
    /// Stored running totals agree with the counts derived from child rows
    pub fn totals_consistent(&self) -> bool {
        self.total_files_analyzed == self.derived_files_analyzed
            && self.total_suggestions == self.derived_suggestions
            && self.approved_suggestions == self.derived_approved
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionSummary {
    pub suggestion_id: String,
    pub suggestion_type: SuggestionType,
    pub status: SuggestionStatus,
    pub title: String,
    pub confidence_score: Option<f64>,
    pub impact_score: Option<f64>,
    pub agent_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub analysis_id: String,
    pub file_path: String,
    pub repository_id: String,
    pub repository_name: String,
    pub repository_owner: String,
    pub repository_url: String,
}

#[derive(Debug, Clone)]
pub struct SummaryViews {
    db: Database,
}

impl SummaryViews {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn repository_summary(&self, repository_id: &str) -> Result<Option<RepositorySummary>> {
        let repository_id = repository_id.to_string();
        self.db
            .read(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT * FROM repository_summary WHERE repository_id = ?1",
                        params![repository_id],
                        map_repository,
                    )
                    .optional()?)
            })
            .await
    }

    pub async fn repository_summaries(&self) -> Result<Vec<RepositorySummary>> {
        self.db
            .read(|conn| {
                let mut stmt = conn.prepare("SELECT * FROM repository_summary ORDER BY owner, name")?;
                let rows = stmt
                    .query_map([], map_repository)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn workflow_summary(&self, workflow_id: &str) -> Result<Option<WorkflowSummary>> {
        let workflow_id = workflow_id.to_string();
        self.db
            .read(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT * FROM workflow_summary WHERE workflow_id = ?1",
                        params![workflow_id],
                        map_workflow,
                    )
                    .optional()?)
            })
            .await
    }

    /// All workflows, most recently started first
    pub async fn workflow_summaries(&self) -> Result<Vec<WorkflowSummary>> {
        self.db
            .read(|conn| {
                let mut stmt = conn.prepare("SELECT * FROM workflow_summary ORDER BY start_time DESC")?;
                let rows = stmt
                    .query_map([], map_workflow)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Suggestions of a repository, best confidence first
    pub async fn suggestion_summaries(&self, repository_id: &str) -> Result<Vec<SuggestionSummary>> {
        let repository_id = repository_id.to_string();
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT * FROM suggestion_summary WHERE repository_id = ?1
                     ORDER BY confidence_score IS NULL, confidence_score DESC, created_at",
                )?;
                let rows = stmt
                    .query_map(params![repository_id], map_suggestion)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn map_repository(row: &Row) -> rusqlite::Result<RepositorySummary> {
    Ok(RepositorySummary {
        repository_id: row.get("repository_id")?,
        url: row.get("url")?,
        name: row.get("name")?,
        owner: row.get("owner")?,
        clone_status: row.get("clone_status")?,
        last_analyzed: row.get("last_analyzed")?,
        analyzed_files: row.get("analyzed_files")?,
        total_suggestions: row.get("total_suggestions")?,
        avg_complexity: row.get("avg_complexity")?,
        avg_quality: row.get("avg_quality")?,
        last_analysis_at: row.get("last_analysis_at")?,
    })
}

fn map_workflow(row: &Row) -> rusqlite::Result<WorkflowSummary> {
    Ok(WorkflowSummary {
        workflow_state_id: row.get("workflow_state_id")?,
        workflow_id: row.get("workflow_id")?,
        repository_id: row.get("repository_id")?,
        repository_name: row.get("repository_name")?,
        repository_owner: row.get("repository_owner")?,
        repository_url: row.get("repository_url")?,
        status: row.get("status")?,
        execution_status: row.get("execution_status")?,
        current_agent: row.get("current_agent")?,
        current_step: row.get("current_step")?,
        progress_percentage: row.get("progress_percentage")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        execution_time_seconds: row.get("execution_time_seconds")?,
        total_files_analyzed: row.get("total_files_analyzed")?,
        total_suggestions: row.get("total_suggestions")?,
        approved_suggestions: row.get("approved_suggestions")?,
        derived_files_analyzed: row.get("derived_files_analyzed")?,
        derived_suggestions: row.get("derived_suggestions")?,
        derived_approved: row.get("derived_approved")?,
        branch_name: row.get("branch_name")?,
        pull_request_url: row.get("pull_request_url")?,
    })
}

fn map_suggestion(row: &Row) -> rusqlite::Result<SuggestionSummary> {
    Ok(SuggestionSummary {
        suggestion_id: row.get("suggestion_id")?,
        suggestion_type: row.get("suggestion_type")?,
        status: row.get("status")?,
        title: row.get("title")?,
        confidence_score: row.get("confidence_score")?,
        impact_score: row.get("impact_score")?,
        agent_name: row.get("agent_name")?,
        created_at: row.get("created_at")?,
        analysis_id: row.get("analysis_id")?,
        file_path: row.get("file_path")?,
        repository_id: row.get("repository_id")?,
        repository_name: row.get("repository_name")?,
        repository_owner: row.get("repository_owner")?,
        repository_url: row.get("repository_url")?,
    })
}
