//! Workflow states and their lifecycle
//!
//! ```text
//! initialized -> running <-> paused
//!                running | paused -> completed | failed
//! ```
//!
//! `completed` and `failed` are terminal. A repository may have any number
//! of terminal workflows but at most one that is not; the partial unique
//! index `idx_workflow_states_one_active` backs that up at the SQL level.
//!
//! The running totals (`total_files_analyzed`, `total_suggestions`,
//! `approved_suggestions`) are written only by [`refresh_totals`], inside the
//! same transaction as the change that moved them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::repository;
use crate::db::stamp::{new_id, Clock, UpdateSet};
use crate::db::Database;
use crate::error::{unique_violation, Result, StoreError};

text_enum! {
    pub enum WorkflowStatus {
        Initialized => "initialized",
        Running => "running",
        Paused => "paused",
        Completed => "completed",
        Failed => "failed",
    }
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    /// Whether `target` is one step away from `self`
    pub fn can_transition_to(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, target),
            (Initialized, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }

    /// Coarse label used by the workflow summary
    pub fn execution_label(&self) -> &'static str {
        match self {
            WorkflowStatus::Completed => "success",
            WorkflowStatus::Failed => "failed",
            _ => "running",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub repository_id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub current_agent: Option<String>,
    pub current_step: Option<String>,
    pub progress_percentage: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub execution_time_seconds: Option<f64>,
    pub total_files_analyzed: i64,
    pub total_suggestions: i64,
    pub approved_suggestions: i64,
    pub agent_config: Option<Value>,
    pub context_data: Option<Value>,
    pub error_log: Option<Value>,
    pub branch_name: Option<String>,
    pub pull_request_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Entries recorded through [`WorkflowStore::record_error`]
    pub fn errors(&self) -> Vec<ErrorEntry> {
        self.error_log
            .clone()
            .and_then(|log| serde_json::from_value(log).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub agent: Option<String>,
    pub step: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub repository_id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub current_agent: Option<String>,
    #[serde(default)]
    pub agent_config: Option<Value>,
    #[serde(default)]
    pub context_data: Option<Value>,
}

impl NewWorkflow {
    pub fn new(repository_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            workflow_id: workflow_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total_workflows: i64,
    pub by_status: BTreeMap<String, i64>,
    pub avg_execution_times: BTreeMap<String, f64>,
}

/// Seconds between two instants, at microsecond precision
pub fn duration_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let elapsed = end - start;
    match elapsed.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => elapsed.num_milliseconds() as f64 / 1_000.0,
    }
}

const COLUMNS: &str = "id, repository_id, workflow_id, status, current_agent, current_step,
    progress_percentage, start_time, end_time, execution_time_seconds, total_files_analyzed,
    total_suggestions, approved_suggestions, agent_config, context_data, error_log, branch_name,
    pull_request_url, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Start bookkeeping for a new workflow run
    pub async fn create(&self, new: NewWorkflow) -> Result<WorkflowState> {
        self.db
            .write(move |tx, clock| {
                if !repository::exists(tx, &new.repository_id)? {
                    return Err(StoreError::ForeignKeyViolation(format!(
                        "workflow '{}' references missing repository {}",
                        new.workflow_id, new.repository_id
                    )));
                }
                if fetch_by_workflow_id(tx, &new.workflow_id)?.is_some() {
                    return Err(StoreError::DuplicateKey {
                        entity: "workflow",
                        key: new.workflow_id,
                    });
                }
                if let Some(active) = active_for_repository(tx, &new.repository_id)? {
                    tracing::warn!(
                        "Rejected workflow {}: repository {} already runs {}",
                        new.workflow_id,
                        new.repository_id,
                        active.workflow_id
                    );
                    return Err(StoreError::WorkflowAlreadyActive {
                        repository_id: new.repository_id,
                        active_workflow: active.workflow_id,
                    });
                }

                let now = clock.now();
                let workflow = WorkflowState {
                    id: new_id(),
                    repository_id: new.repository_id,
                    workflow_id: new.workflow_id,
                    status: WorkflowStatus::Initialized,
                    current_agent: new.current_agent,
                    current_step: None,
                    progress_percentage: 0.0,
                    start_time: now,
                    end_time: None,
                    execution_time_seconds: None,
                    total_files_analyzed: 0,
                    total_suggestions: 0,
                    approved_suggestions: 0,
                    agent_config: new.agent_config,
                    context_data: new.context_data,
                    error_log: None,
                    branch_name: None,
                    pull_request_url: None,
                    created_at: now,
                    updated_at: now,
                };

                tx.execute(
                    "INSERT INTO workflow_states (id, repository_id, workflow_id, status, current_agent,
                        progress_percentage, start_time, agent_config, context_data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        workflow.id,
                        workflow.repository_id,
                        workflow.workflow_id,
                        workflow.status,
                        workflow.current_agent,
                        workflow.progress_percentage,
                        workflow.start_time,
                        workflow.agent_config,
                        workflow.context_data,
                        workflow.created_at,
                        workflow.updated_at,
                    ],
                )
                .map_err(|e| match unique_violation(&e) {
                    Some(msg) if msg.contains("workflow_states.repository_id") => {
                        StoreError::WorkflowAlreadyActive {
                            repository_id: workflow.repository_id.clone(),
                            active_workflow: "unknown".to_string(),
                        }
                    }
                    Some(_) => StoreError::DuplicateKey {
                        entity: "workflow",
                        key: workflow.workflow_id.clone(),
                    },
                    None => e.into(),
                })?;

                tracing::info!(
                    "Created workflow {} for repository {}",
                    workflow.workflow_id,
                    workflow.repository_id
                );
                Ok(workflow)
            })
            .await
    }

    /// Get a workflow by its row ID
    pub async fn get(&self, id: &str) -> Result<Option<WorkflowState>> {
        let id = id.to_string();
        self.db.read(move |conn| fetch(conn, &id)).await
    }

    /// Get a workflow by its external workflow identifier
    pub async fn get_by_workflow_id(&self, workflow_id: &str) -> Result<Option<WorkflowState>> {
        let workflow_id = workflow_id.to_string();
        self.db
            .read(move |conn| fetch_by_workflow_id(conn, &workflow_id))
            .await
    }

    /// All runs for a repository, newest first
    pub async fn list_by_repository(&self, repository_id: &str) -> Result<Vec<WorkflowState>> {
        let repository_id = repository_id.to_string();
        self.db
            .read(move |conn| {
                query_list(
                    conn,
                    "WHERE repository_id = ?1 ORDER BY created_at DESC, id",
                    params![repository_id],
                )
            })
            .await
    }

    /// Every workflow that has not reached a terminal status
    pub async fn active(&self) -> Result<Vec<WorkflowState>> {
        self.db
            .read(|conn| {
                query_list(
                    conn,
                    "WHERE status NOT IN ('completed', 'failed') ORDER BY created_at, id",
                    [],
                )
            })
            .await
    }

    pub async fn failed(&self) -> Result<Vec<WorkflowState>> {
        self.db
            .read(|conn| {
                query_list(
                    conn,
                    "WHERE status = 'failed' ORDER BY updated_at DESC, id",
                    [],
                )
            })
            .await
    }

    /// Move a workflow to `target`.
    ///
    /// Same-status requests succeed without writing anything.
    pub async fn transition(&self, workflow_id: &str, target: WorkflowStatus) -> Result<WorkflowState> {
        let workflow_id = workflow_id.to_string();
        self.db
            .write(move |tx, clock| apply_transition(tx, clock, &workflow_id, target))
            .await
    }

    /// Advance progress, optionally naming the step and agent now in charge.
    ///
    /// Progress never decreases and is never clamped.
    pub async fn update_progress(
        &self,
        workflow_id: &str,
        percentage: f64,
        step: Option<String>,
        agent: Option<String>,
    ) -> Result<WorkflowState> {
        let workflow_id = workflow_id.to_string();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &workflow_id)?;
                let invalid = StoreError::InvalidProgress {
                    current: current.progress_percentage,
                    requested: percentage,
                };

                if !percentage.is_finite() || !(0.0..=100.0).contains(&percentage) {
                    return Err(invalid);
                }
                if current.status.is_terminal() || percentage < current.progress_percentage {
                    tracing::warn!(
                        "Rejected progress {} for workflow {} ({} at {})",
                        percentage,
                        workflow_id,
                        current.status,
                        current.progress_percentage
                    );
                    return Err(invalid);
                }

                let mut set = UpdateSet::new("workflow_states");
                if percentage != current.progress_percentage {
                    set.set("progress_percentage", percentage);
                }
                set.set_opt("current_step", step.filter(|s| current.current_step.as_ref() != Some(s)))
                    .set_opt("current_agent", agent.filter(|a| current.current_agent.as_ref() != Some(a)));

                if set.is_empty() {
                    return Ok(current);
                }
                set.apply(tx, &current.id, clock.now())?;
                require(tx, &workflow_id)
            })
            .await
    }

    /// Append an entry to the workflow's error log
    pub async fn record_error(
        &self,
        workflow_id: &str,
        message: impl Into<String>,
        error_type: impl Into<String>,
    ) -> Result<WorkflowState> {
        let workflow_id = workflow_id.to_string();
        let message = message.into();
        let error_type = error_type.into();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &workflow_id)?;
                let now = clock.now();

                let mut entries = current.errors();
                entries.push(ErrorEntry {
                    timestamp: now,
                    error_type,
                    message,
                    agent: current.current_agent.clone(),
                    step: current.current_step.clone(),
                });

                let mut set = UpdateSet::new("workflow_states");
                set.set("error_log", serde_json::to_value(&entries)?);
                set.apply(tx, &current.id, now)?;

                tracing::debug!("Recorded error #{} for workflow {}", entries.len(), workflow_id);
                require(tx, &workflow_id)
            })
            .await
    }

    /// Replace the serialized workflow context
    pub async fn set_context(&self, workflow_id: &str, context_data: Value) -> Result<WorkflowState> {
        let workflow_id = workflow_id.to_string();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &workflow_id)?;
                if current.context_data.as_ref() == Some(&context_data) {
                    return Ok(current);
                }
                let mut set = UpdateSet::new("workflow_states");
                set.set("context_data", context_data);
                set.apply(tx, &current.id, clock.now())?;
                require(tx, &workflow_id)
            })
            .await
    }

    /// Record where the workflow's output landed
    pub async fn set_output(
        &self,
        workflow_id: &str,
        branch_name: Option<String>,
        pull_request_url: Option<String>,
    ) -> Result<WorkflowState> {
        let workflow_id = workflow_id.to_string();
        self.db
            .write(move |tx, clock| {
                let current = require(tx, &workflow_id)?;
                let mut set = UpdateSet::new("workflow_states");
                set.set_opt("branch_name", branch_name)
                    .set_opt("pull_request_url", pull_request_url);
                if set.is_empty() {
                    return Ok(current);
                }
                set.apply(tx, &current.id, clock.now())?;
                require(tx, &workflow_id)
            })
            .await
    }

    /// Counts and mean execution time per status
    pub async fn statistics(&self) -> Result<WorkflowStatistics> {
        self.db
            .read(|conn| {
                let mut stats = WorkflowStatistics::default();
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*), AVG(execution_time_seconds)
                     FROM workflow_states GROUP BY status",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                    ))
                })?;
                for row in rows {
                    let (status, count, avg) = row?;
                    stats.total_workflows += count;
                    if let Some(avg) = avg {
                        stats.avg_execution_times.insert(status.clone(), avg);
                    }
                    stats.by_status.insert(status, count);
                }
                Ok(stats)
            })
            .await
    }

    /// Delete a workflow and its logs and metrics
    pub async fn delete(&self, workflow_id: &str) -> Result<()> {
        let workflow_id = workflow_id.to_string();
        self.db
            .write(move |tx, clock| {
                let workflow_pk = resolve(tx, &workflow_id)?
                    .ok_or_else(|| StoreError::not_found("workflow", &workflow_id))?;

                // Unlink analyses here so each one gets its updated_at stamp
                let unlinked = tx.execute(
                    "UPDATE code_analyses SET workflow_state_id = NULL, updated_at = ?1
                     WHERE workflow_state_id = ?2",
                    params![clock.now(), workflow_pk],
                )?;
                tx.execute("DELETE FROM workflow_states WHERE id = ?1", params![workflow_pk])?;
                tracing::info!("Deleted workflow {} ({} analyses unlinked)", workflow_id, unlinked);
                Ok(())
            })
            .await
    }
}

fn apply_transition(
    conn: &Connection,
    clock: &dyn Clock,
    workflow_id: &str,
    target: WorkflowStatus,
) -> Result<WorkflowState> {
    let current = require(conn, workflow_id)?;
    if current.status == target {
        return Ok(current);
    }
    if !current.status.can_transition_to(target) {
        tracing::warn!(
            "Rejected transition for workflow {}: {} -> {}",
            workflow_id,
            current.status,
            target
        );
        return Err(StoreError::InvalidTransition {
            entity: "workflow",
            from: current.status.to_string(),
            to: target.to_string(),
        });
    }

    let now = clock.now();
    let mut set = UpdateSet::new("workflow_states");
    set.set("status", target);
    if target.is_terminal() {
        let end = now.max(current.start_time);
        set.set("end_time", end)
            .set("execution_time_seconds", duration_seconds(current.start_time, end));
        if target == WorkflowStatus::Completed && current.progress_percentage < 100.0 {
            set.set("progress_percentage", 100.0_f64);
        }
    }
    set.apply(conn, &current.id, now)?;

    tracing::info!("Workflow {}: {} -> {}", workflow_id, current.status, target);
    require(conn, workflow_id)
}

/// Recompute a workflow's running totals from its child rows.
///
/// Touches the row only when a total actually changed.
pub(crate) fn refresh_totals(conn: &Connection, workflow_pk: &str, now: DateTime<Utc>) -> Result<()> {
    let stored: Option<(i64, i64, i64)> = conn
        .query_row(
            "SELECT total_files_analyzed, total_suggestions, approved_suggestions
             FROM workflow_states WHERE id = ?1",
            params![workflow_pk],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some(stored) = stored else {
        return Ok(());
    };

    let derived: (i64, i64, i64) = conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM code_analyses
                WHERE workflow_state_id = ?1 AND status = 'completed'),
            (SELECT COUNT(*) FROM suggestions s
                JOIN code_analyses ca ON ca.id = s.analysis_id
                WHERE ca.workflow_state_id = ?1),
            (SELECT COUNT(*) FROM suggestions s
                JOIN code_analyses ca ON ca.id = s.analysis_id
                WHERE ca.workflow_state_id = ?1 AND s.status IN ('approved', 'applied'))",
        params![workflow_pk],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    if stored == derived {
        return Ok(());
    }

    let mut set = UpdateSet::new("workflow_states");
    set.set("total_files_analyzed", derived.0)
        .set("total_suggestions", derived.1)
        .set("approved_suggestions", derived.2);
    set.apply(conn, workflow_pk, now)?;

    tracing::debug!(
        "Workflow {} totals: {} files, {} suggestions, {} approved",
        workflow_pk,
        derived.0,
        derived.1,
        derived.2
    );
    Ok(())
}

/// The non-terminal workflow of a repository, if any
pub(crate) fn active_for_repository(conn: &Connection, repository_id: &str) -> Result<Option<WorkflowState>> {
    let sql = format!(
        "SELECT {} FROM workflow_states
         WHERE repository_id = ?1 AND status NOT IN ('completed', 'failed')",
        COLUMNS
    );
    Ok(conn.query_row(&sql, params![repository_id], map_row).optional()?)
}

/// Row ID for an external workflow identifier
pub(crate) fn resolve(conn: &Connection, workflow_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM workflow_states WHERE workflow_id = ?1",
            params![workflow_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn fetch_by_workflow_id(conn: &Connection, workflow_id: &str) -> Result<Option<WorkflowState>> {
    let sql = format!("SELECT {} FROM workflow_states WHERE workflow_id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![workflow_id], map_row).optional()?)
}

fn fetch(conn: &Connection, id: &str) -> Result<Option<WorkflowState>> {
    let sql = format!("SELECT {} FROM workflow_states WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], map_row).optional()?)
}

fn require(conn: &Connection, workflow_id: &str) -> Result<WorkflowState> {
    fetch_by_workflow_id(conn, workflow_id)?.ok_or_else(|| StoreError::not_found("workflow", workflow_id))
}

fn query_list<P: rusqlite::Params>(conn: &Connection, clause: &str, params: P) -> Result<Vec<WorkflowState>> {
    let sql = format!("SELECT {} FROM workflow_states {}", COLUMNS, clause);
    let mut stmt = conn.prepare(&sql)?;
    let workflows = stmt
        .query_map(params, map_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(workflows)
}

fn map_row(row: &Row) -> rusqlite::Result<WorkflowState> {
    Ok(WorkflowState {
        id: row.get("id")?,
        repository_id: row.get("repository_id")?,
        workflow_id: row.get("workflow_id")?,
        status: row.get("status")?,
        current_agent: row.get("current_agent")?,
        current_step: row.get("current_step")?,
        progress_percentage: row.get("progress_percentage")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        execution_time_seconds: row.get("execution_time_seconds")?,
        total_files_analyzed: row.get("total_files_analyzed")?,
        total_suggestions: row.get("total_suggestions")?,
        approved_suggestions: row.get("approved_suggestions")?,
        agent_config: row.get("agent_config")?,
        context_data: row.get("context_data")?,
        error_log: row.get("error_log")?,
        branch_name: row.get("branch_name")?,
        pull_request_url: row.get("pull_request_url")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
