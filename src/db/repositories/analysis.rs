//! Per-file code analysis records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{repository, workflow};
use crate::db::stamp::{new_id, UpdateSet};
use crate::db::Database;
use crate::error::{unique_violation, Result, StoreError};

text_enum! {
    pub enum AnalysisStatus {
        Pending => "pending",
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }

    pub fn can_transition_to(&self, target: AnalysisStatus) -> bool {
        use AnalysisStatus::*;
        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeAnalysis {
    pub id: String,
    pub repository_id: String,
    /// Workflow that was active for the repository when the file was queued
    pub workflow_state_id: Option<String>,
    pub file_path: String,
    pub status: AnalysisStatus,
    pub language: Option<String>,
    pub lines_of_code: Option<i64>,
    pub complexity_score: Option<f64>,
    pub quality_score: Option<f64>,
    pub functions: Option<Value>,
    pub classes: Option<Value>,
    pub imports: Option<Value>,
    pub comments: Option<Value>,
    pub summary: Option<String>,
    pub issues_found: Option<Value>,
    pub dependencies: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAnalysis {
    pub repository_id: String,
    pub file_path: String,
    #[serde(default)]
    pub language: Option<String>,
}

impl NewAnalysis {
    pub fn new(repository_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            file_path: file_path.into(),
            language: None,
        }
    }
}

/// Analysis results written by the analyzing agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisUpdate {
    pub language: Option<String>,
    pub lines_of_code: Option<i64>,
    pub complexity_score: Option<f64>,
    pub quality_score: Option<f64>,
    pub functions: Option<Value>,
    pub classes: Option<Value>,
    pub imports: Option<Value>,
    pub comments: Option<Value>,
    pub summary: Option<String>,
    pub issues_found: Option<Value>,
    pub dependencies: Option<Value>,
}

impl AnalysisUpdate {
    fn into_set(self) -> UpdateSet {
        let mut set = UpdateSet::new("code_analyses");
        set.set_opt("language", self.language)
            .set_opt("lines_of_code", self.lines_of_code)
            .set_opt("complexity_score", self.complexity_score)
            .set_opt("quality_score", self.quality_score)
            .set_opt("functions", self.functions)
            .set_opt("classes", self.classes)
            .set_opt("imports", self.imports)
            .set_opt("comments", self.comments)
            .set_opt("summary", self.summary)
            .set_opt("issues_found", self.issues_found)
            .set_opt("dependencies", self.dependencies);
        set
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisStats {
    pub total_files: i64,
    pub by_status: BTreeMap<String, i64>,
    pub avg_complexity: Option<f64>,
    pub avg_quality: Option<f64>,
}

const COLUMNS: &str = "id, repository_id, workflow_state_id, file_path, status, language,
    lines_of_code, complexity_score, quality_score, functions, classes, imports, comments,
    summary, issues_found, dependencies, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct AnalysisStore {
    db: Database,
}

impl AnalysisStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Queue a file for analysis
    pub async fn create(&self, new: NewAnalysis) -> Result<CodeAnalysis> {
        self.db
            .write(move |tx, clock| {
                if !repository::exists(tx, &new.repository_id)? {
                    return Err(StoreError::ForeignKeyViolation(format!(
                        "analysis of '{}' references missing repository {}",
                        new.file_path, new.repository_id
                    )));
                }

                let workflow_state_id =
                    workflow::active_for_repository(tx, &new.repository_id)?.map(|w| w.id);
                let now = clock.now();
                let analysis = CodeAnalysis {
                    id: new_id(),
                    repository_id: new.repository_id,
                    workflow_state_id,
                    file_path: new.file_path,
                    status: AnalysisStatus::Pending,
                    language: new.language,
                    lines_of_code: None,
                    complexity_score: None,
                    quality_score: None,
                    functions: None,
                    classes: None,
                    imports: None,
                    comments: None,
                    summary: None,
                    issues_found: None,
                    dependencies: None,
                    created_at: now,
                    updated_at: now,
                };

                tx.execute(
                    "INSERT INTO code_analyses (id, repository_id, workflow_state_id, file_path, status,
                        language, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        analysis.id,
                        analysis.repository_id,
                        analysis.workflow_state_id,
                        analysis.file_path,
                        analysis.status,
                        analysis.language,
                        analysis.created_at,
                        analysis.updated_at,
                    ],
                )
                .map_err(|e| match unique_violation(&e) {
                    Some(_) => StoreError::DuplicateKey {
                        entity: "analysis",
                        key: format!("{}:{}", analysis.repository_id, analysis.file_path),
                    },
                    None => e.into(),
                })?;

                tracing::debug!("Queued analysis {} for {}", analysis.id, analysis.file_path);
                Ok(analysis)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<CodeAnalysis>> {
        let id = id.to_string();
        self.db.read(move |conn| fetch(conn, &id)).await
    }

    /// Analysis of one file in one repository
    pub async fn get_by_path(&self, repository_id: &str, file_path: &str) -> Result<Option<CodeAnalysis>> {
        let repository_id = repository_id.to_string();
        let file_path = file_path.to_string();
        self.db
            .read(move |conn| {
                let sql = format!(
                    "SELECT {} FROM code_analyses WHERE repository_id = ?1 AND file_path = ?2",
                    COLUMNS
                );
                Ok(conn
                    .query_row(&sql, params![repository_id, file_path], map_row)
                    .optional()?)
            })
            .await
    }

    pub async fn list_by_repository(
        &self,
        repository_id: &str,
        status: Option<AnalysisStatus>,
    ) -> Result<Vec<CodeAnalysis>> {
        let repository_id = repository_id.to_string();
        self.db
            .read(move |conn| {
                let mut sql = format!("SELECT {} FROM code_analyses WHERE repository_id = ?1", COLUMNS);
                let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(repository_id)];
                if let Some(st) = status {
                    sql.push_str(" AND status = ?2");
                    params.push(Box::new(st));
                }
                sql.push_str(" ORDER BY file_path");

                let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let analyses = stmt
                    .query_map(params_refs.as_slice(), map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(analyses)
            })
            .await
    }

    /// Failed analyses across all repositories, for retry
    pub async fn failed(&self) -> Result<Vec<CodeAnalysis>> {
        self.db
            .read(|conn| {
                let sql = format!(
                    "SELECT {} FROM code_analyses WHERE status = 'failed' ORDER BY updated_at DESC",
                    COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let analyses = stmt
                    .query_map([], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(analyses)
            })
            .await
    }

    /// Store analysis results as one mutation
    pub async fn update(&self, id: &str, update: AnalysisUpdate) -> Result<CodeAnalysis> {
        let id = id.to_string();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &id)?;
                let set = update.into_set();
                if set.is_empty() {
                    return Ok(current);
                }
                if current.status.is_terminal() {
                    return Err(StoreError::Immutable {
                        entity: "analysis",
                        id,
                        status: current.status.to_string(),
                    });
                }
                set.apply(tx, &id, clock.now())?;
                require(tx, &id)
            })
            .await
    }

    /// Move an analysis through pending -> running -> completed | failed
    pub async fn set_status(&self, id: &str, status: AnalysisStatus) -> Result<CodeAnalysis> {
        let id = id.to_string();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &id)?;
                if current.status == status {
                    return Ok(current);
                }
                if !current.status.can_transition_to(status) {
                    tracing::warn!("Rejected analysis {} transition {} -> {}", id, current.status, status);
                    return Err(StoreError::InvalidTransition {
                        entity: "analysis",
                        from: current.status.to_string(),
                        to: status.to_string(),
                    });
                }

                let now = clock.now();
                let mut set = UpdateSet::new("code_analyses");
                set.set("status", status);
                set.apply(tx, &id, now)?;

                if let Some(workflow_pk) = &current.workflow_state_id {
                    workflow::refresh_totals(tx, workflow_pk, now)?;
                }

                tracing::debug!("Analysis {} -> {}", id, status);
                require(tx, &id)
            })
            .await
    }

    /// Counts per status and mean scores for a repository
    pub async fn summary_stats(&self, repository_id: &str) -> Result<AnalysisStats> {
        let repository_id = repository_id.to_string();
        self.db
            .read(move |conn| {
                let mut stats = AnalysisStats::default();
                {
                    let mut stmt = conn.prepare(
                        "SELECT status, COUNT(*) FROM code_analyses
                         WHERE repository_id = ?1 GROUP BY status",
                    )?;
                    let rows = stmt.query_map(params![repository_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?;
                    for row in rows {
                        let (status, count) = row?;
                        stats.total_files += count;
                        stats.by_status.insert(status, count);
                    }
                }
                let (avg_complexity, avg_quality) = conn.query_row(
                    "SELECT AVG(complexity_score), AVG(quality_score)
                     FROM code_analyses WHERE repository_id = ?1",
                    params![repository_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                stats.avg_complexity = avg_complexity;
                stats.avg_quality = avg_quality;
                Ok(stats)
            })
            .await
    }

    /// Delete an analysis with its suggestions and quality metrics
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &id)?;
                tx.execute("DELETE FROM code_analyses WHERE id = ?1", params![id])?;
                if let Some(workflow_pk) = &current.workflow_state_id {
                    workflow::refresh_totals(tx, workflow_pk, clock.now())?;
                }
                tracing::debug!("Deleted analysis {}", id);
                Ok(())
            })
            .await
    }
}

pub(crate) fn fetch(conn: &Connection, id: &str) -> Result<Option<CodeAnalysis>> {
    let sql = format!("SELECT {} FROM code_analyses WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], map_row).optional()?)
}

fn require(conn: &Connection, id: &str) -> Result<CodeAnalysis> {
    fetch(conn, id)?.ok_or_else(|| StoreError::not_found("analysis", id))
}

fn map_row(row: &Row) -> rusqlite::Result<CodeAnalysis> {
    Ok(CodeAnalysis {
        id: row.get("id")?,
        repository_id: row.get("repository_id")?,
        workflow_state_id: row.get("workflow_state_id")?,
        file_path: row.get("file_path")?,
        status: row.get("status")?,
        language: row.get("language")?,
        lines_of_code: row.get("lines_of_code")?,
        complexity_score: row.get("complexity_score")?,
        quality_score: row.get("quality_score")?,
        functions: row.get("functions")?,
        classes: row.get("classes")?,
        imports: row.get("imports")?,
        comments: row.get("comments")?,
        summary: row.get("summary")?,
        issues_found: row.get("issues_found")?,
        dependencies: row.get("dependencies")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
