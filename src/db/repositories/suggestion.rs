//! Suggestions produced by agents and their review lifecycle

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{analysis, workflow};
use crate::db::stamp::{new_id, UpdateSet};
use crate::db::Database;
use crate::error::{Result, StoreError};

text_enum! {
    pub enum SuggestionType {
        BugFix => "bug_fix",
        Improvement => "improvement",
        Optimization => "optimization",
        CodeCompletion => "code_completion",
        Refactoring => "refactoring",
    }
}

text_enum! {
    pub enum SuggestionStatus {
        Generated => "generated",
        Reviewed => "reviewed",
        Approved => "approved",
        Rejected => "rejected",
        Applied => "applied",
    }
}

impl SuggestionStatus {
    /// Applied and rejected suggestions are frozen
    pub fn is_final(&self) -> bool {
        matches!(self, SuggestionStatus::Applied | SuggestionStatus::Rejected)
    }

    /// Counted in a workflow's `approved_suggestions`
    pub fn counts_as_approved(&self) -> bool {
        matches!(self, SuggestionStatus::Approved | SuggestionStatus::Applied)
    }

    pub fn can_transition_to(&self, target: SuggestionStatus) -> bool {
        use SuggestionStatus::*;
        matches!(
            (self, target),
            (Generated, Reviewed)
                | (Generated, Approved)
                | (Generated, Rejected)
                | (Reviewed, Approved)
                | (Reviewed, Rejected)
                | (Approved, Applied)
                | (Approved, Rejected)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub analysis_id: String,
    pub suggestion_type: SuggestionType,
    pub status: SuggestionStatus,
    pub title: String,
    pub description: String,
    pub original_code: Option<String>,
    pub suggested_code: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub confidence_score: Option<f64>,
    pub impact_score: Option<f64>,
    pub agent_name: Option<String>,
    pub test_results: Option<Value>,
    pub feedback: Option<String>,
    pub difficulty: Option<String>,
    pub estimated_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSuggestion {
    pub analysis_id: String,
    pub suggestion_type: SuggestionType,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub original_code: Option<String>,
    #[serde(default)]
    pub suggested_code: Option<String>,
    #[serde(default)]
    pub line_start: Option<i64>,
    #[serde(default)]
    pub line_end: Option<i64>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
    #[serde(default)]
    pub impact_score: Option<f64>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub estimated_minutes: Option<i64>,
}

impl NewSuggestion {
    pub fn new(
        analysis_id: impl Into<String>,
        suggestion_type: SuggestionType,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            suggestion_type,
            title: title.into(),
            description: description.into(),
            original_code: None,
            suggested_code: None,
            line_start: None,
            line_end: None,
            confidence_score: None,
            impact_score: None,
            agent_name: None,
            difficulty: None,
            estimated_minutes: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub original_code: Option<String>,
    pub suggested_code: Option<String>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub confidence_score: Option<f64>,
    pub impact_score: Option<f64>,
    pub test_results: Option<Value>,
    pub feedback: Option<String>,
    pub difficulty: Option<String>,
    pub estimated_minutes: Option<i64>,
}

impl SuggestionUpdate {
    fn into_set(self) -> Result<UpdateSet> {
        check_scores(self.confidence_score, self.impact_score)?;
        let mut set = UpdateSet::new("suggestions");
        set.set_opt("title", self.title)
            .set_opt("description", self.description)
            .set_opt("original_code", self.original_code)
            .set_opt("suggested_code", self.suggested_code)
            .set_opt("line_start", self.line_start)
            .set_opt("line_end", self.line_end)
            .set_opt("confidence_score", self.confidence_score)
            .set_opt("impact_score", self.impact_score)
            .set_opt("test_results", self.test_results)
            .set_opt("feedback", self.feedback)
            .set_opt("difficulty", self.difficulty)
            .set_opt("estimated_minutes", self.estimated_minutes);
        Ok(set)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeStatusCount {
    pub suggestion_type: String,
    pub status: String,
    pub count: i64,
    pub avg_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuggestionStatistics {
    pub total_suggestions: i64,
    pub by_type_and_status: Vec<TypeStatusCount>,
}

const COLUMNS: &str = "id, analysis_id, suggestion_type, status, title, description,
    original_code, suggested_code, line_start, line_end, confidence_score, impact_score,
    agent_name, test_results, feedback, difficulty, estimated_minutes, created_at, updated_at,
    reviewed_at";

#[derive(Debug, Clone)]
pub struct SuggestionStore {
    db: Database,
}

impl SuggestionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a new suggestion against an analysis
    pub async fn create(&self, new: NewSuggestion) -> Result<Suggestion> {
        check_scores(new.confidence_score, new.impact_score)?;
        self.db
            .write(move |tx, clock| {
                let parent = analysis::fetch(tx, &new.analysis_id)?.ok_or_else(|| {
                    StoreError::ForeignKeyViolation(format!(
                        "suggestion '{}' references missing analysis {}",
                        new.title, new.analysis_id
                    ))
                })?;

                let now = clock.now();
                let suggestion = Suggestion {
                    id: new_id(),
                    analysis_id: new.analysis_id,
                    suggestion_type: new.suggestion_type,
                    status: SuggestionStatus::Generated,
                    title: new.title,
                    description: new.description,
                    original_code: new.original_code,
                    suggested_code: new.suggested_code,
                    line_start: new.line_start,
                    line_end: new.line_end,
                    confidence_score: new.confidence_score,
                    impact_score: new.impact_score,
                    agent_name: new.agent_name,
                    test_results: None,
                    feedback: None,
                    difficulty: new.difficulty,
                    estimated_minutes: new.estimated_minutes,
                    created_at: now,
                    updated_at: now,
                    reviewed_at: None,
                };

                tx.execute(
                    "INSERT INTO suggestions (id, analysis_id, suggestion_type, status, title, description,
                        original_code, suggested_code, line_start, line_end, confidence_score, impact_score,
                        agent_name, difficulty, estimated_minutes, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params![
                        suggestion.id,
                        suggestion.analysis_id,
                        suggestion.suggestion_type,
                        suggestion.status,
                        suggestion.title,
                        suggestion.description,
                        suggestion.original_code,
                        suggestion.suggested_code,
                        suggestion.line_start,
                        suggestion.line_end,
                        suggestion.confidence_score,
                        suggestion.impact_score,
                        suggestion.agent_name,
                        suggestion.difficulty,
                        suggestion.estimated_minutes,
                        suggestion.created_at,
                        suggestion.updated_at,
                    ],
                )?;

                if let Some(workflow_pk) = &parent.workflow_state_id {
                    workflow::refresh_totals(tx, workflow_pk, now)?;
                }

                tracing::debug!(
                    "Created {} suggestion {} for {}",
                    suggestion.suggestion_type,
                    suggestion.id,
                    parent.file_path
                );
                Ok(suggestion)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Suggestion>> {
        let id = id.to_string();
        self.db.read(move |conn| fetch(conn, &id)).await
    }

    /// Suggestions for an analysis, most confident first
    pub async fn list_by_analysis(
        &self,
        analysis_id: &str,
        status: Option<SuggestionStatus>,
    ) -> Result<Vec<Suggestion>> {
        let analysis_id = analysis_id.to_string();
        self.db
            .read(move |conn| {
                let mut clause = String::from("WHERE analysis_id = ?1");
                let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(analysis_id)];
                if let Some(st) = status {
                    clause.push_str(" AND status = ?2");
                    params.push(Box::new(st));
                }
                clause.push_str(" ORDER BY confidence_score DESC, created_at");
                query_list(conn, &clause, params)
            })
            .await
    }

    /// All suggestions for a repository, newest first
    pub async fn list_by_repository(&self, repository_id: &str) -> Result<Vec<Suggestion>> {
        let repository_id = repository_id.to_string();
        self.db
            .read(move |conn| {
                query_list(
                    conn,
                    "WHERE analysis_id IN (SELECT id FROM code_analyses WHERE repository_id = ?1)
                     ORDER BY created_at DESC, id",
                    vec![Box::new(repository_id) as Box<dyn ToSql>],
                )
            })
            .await
    }

    pub async fn list_by_type(
        &self,
        suggestion_type: SuggestionType,
        status: Option<SuggestionStatus>,
    ) -> Result<Vec<Suggestion>> {
        self.db
            .read(move |conn| {
                let mut clause = String::from("WHERE suggestion_type = ?1");
                let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(suggestion_type)];
                if let Some(st) = status {
                    clause.push_str(" AND status = ?2");
                    params.push(Box::new(st));
                }
                clause.push_str(" ORDER BY confidence_score DESC, created_at");
                query_list(conn, &clause, params)
            })
            .await
    }

    pub async fn high_confidence(&self, min_confidence: f64) -> Result<Vec<Suggestion>> {
        self.db
            .read(move |conn| {
                query_list(
                    conn,
                    "WHERE confidence_score >= ?1 ORDER BY confidence_score DESC, created_at",
                    vec![Box::new(min_confidence) as Box<dyn ToSql>],
                )
            })
            .await
    }

    /// Edit a suggestion that is still under review
    pub async fn update(&self, id: &str, update: SuggestionUpdate) -> Result<Suggestion> {
        let id = id.to_string();
        self.db
            .write(move |tx, clock| {
                let set = update.into_set()?;
                let current = require(tx, &id)?;
                if current.status.is_final() {
                    return Err(StoreError::Immutable {
                        entity: "suggestion",
                        id,
                        status: current.status.to_string(),
                    });
                }
                if set.is_empty() {
                    return Ok(current);
                }
                set.apply(tx, &id, clock.now())?;
                require(tx, &id)
            })
            .await
    }

    /// Record a review decision, optionally with reviewer feedback
    pub async fn set_status(
        &self,
        id: &str,
        status: SuggestionStatus,
        feedback: Option<String>,
    ) -> Result<Suggestion> {
        let id = id.to_string();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &id)?;
                if current.status == status && feedback.is_none() {
                    return Ok(current);
                }
                if current.status.is_final() {
                    return Err(StoreError::Immutable {
                        entity: "suggestion",
                        id,
                        status: current.status.to_string(),
                    });
                }
                if current.status != status && !current.status.can_transition_to(status) {
                    tracing::warn!("Rejected suggestion {} transition {} -> {}", id, current.status, status);
                    return Err(StoreError::InvalidTransition {
                        entity: "suggestion",
                        from: current.status.to_string(),
                        to: status.to_string(),
                    });
                }

                let now = clock.now();
                let mut set = UpdateSet::new("suggestions");
                if current.status != status {
                    set.set("status", status);
                    if status != SuggestionStatus::Applied {
                        set.set("reviewed_at", now);
                    }
                }
                set.set_opt("feedback", feedback);
                set.apply(tx, &id, now)?;

                if current.status.counts_as_approved() != status.counts_as_approved() {
                    if let Some(parent) = analysis::fetch(tx, &current.analysis_id)? {
                        if let Some(workflow_pk) = &parent.workflow_state_id {
                            workflow::refresh_totals(tx, workflow_pk, now)?;
                        }
                    }
                }

                tracing::debug!("Suggestion {} -> {}", id, status);
                require(tx, &id)
            })
            .await
    }

    /// Counts and mean confidence by type and status
    pub async fn statistics(&self) -> Result<SuggestionStatistics> {
        self.db
            .read(|conn| {
                let mut stats = SuggestionStatistics::default();
                let mut stmt = conn.prepare(
                    "SELECT suggestion_type, status, COUNT(*), AVG(confidence_score)
                     FROM suggestions GROUP BY suggestion_type, status
                     ORDER BY suggestion_type, status",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(TypeStatusCount {
                        suggestion_type: row.get(0)?,
                        status: row.get(1)?,
                        count: row.get(2)?,
                        avg_confidence: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    })
                })?;
                for row in rows {
                    let row = row?;
                    stats.total_suggestions += row.count;
                    stats.by_type_and_status.push(row);
                }
                Ok(stats)
            })
            .await
    }

    /// Delete a suggestion and its feedback
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &id)?;
                tx.execute("DELETE FROM suggestions WHERE id = ?1", params![id])?;
                if let Some(parent) = analysis::fetch(tx, &current.analysis_id)? {
                    if let Some(workflow_pk) = &parent.workflow_state_id {
                        workflow::refresh_totals(tx, workflow_pk, clock.now())?;
                    }
                }
                tracing::debug!("Deleted suggestion {}", id);
                Ok(())
            })
            .await
    }
}

fn check_scores(confidence: Option<f64>, impact: Option<f64>) -> Result<()> {
    if let Some(value) = confidence {
        StoreError::check_score("confidence_score", value)?;
    }
    if let Some(value) = impact {
        StoreError::check_score("impact_score", value)?;
    }
    Ok(())
}

pub(crate) fn fetch(conn: &Connection, id: &str) -> Result<Option<Suggestion>> {
    let sql = format!("SELECT {} FROM suggestions WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], map_row).optional()?)
}

fn require(conn: &Connection, id: &str) -> Result<Suggestion> {
    fetch(conn, id)?.ok_or_else(|| StoreError::not_found("suggestion", id))
}

fn query_list(conn: &Connection, clause: &str, params: Vec<Box<dyn ToSql>>) -> Result<Vec<Suggestion>> {
    let sql = format!("SELECT {} FROM suggestions {}", COLUMNS, clause);
    let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let suggestions = stmt
        .query_map(params_refs.as_slice(), map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(suggestions)
}

fn map_row(row: &Row) -> rusqlite::Result<Suggestion> {
    Ok(Suggestion {
        id: row.get("id")?,
        analysis_id: row.get("analysis_id")?,
        suggestion_type: row.get("suggestion_type")?,
        status: row.get("status")?,
        title: row.get("title")?,
        description: row.get("description")?,
        original_code: row.get("original_code")?,
        suggested_code: row.get("suggested_code")?,
        line_start: row.get("line_start")?,
        line_end: row.get("line_end")?,
        confidence_score: row.get("confidence_score")?,
        impact_score: row.get("impact_score")?,
        agent_name: row.get("agent_name")?,
        test_results: row.get("test_results")?,
        feedback: row.get("feedback")?,
        difficulty: row.get("difficulty")?,
        estimated_minutes: row.get("estimated_minutes")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        reviewed_at: row.get("reviewed_at")?,
    })
}
