//! Performance, quality and feedback records
//!
//! Everything here is append-only. Recording a metric never writes any
//! aggregate column on the parent row.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::workflow;
use crate::db::Database;
use crate::error::{Result, StoreError};

text_enum! {
    pub enum QualityCategory {
        Complexity => "complexity",
        Maintainability => "maintainability",
        Security => "security",
        Performance => "performance",
    }
}

text_enum! {
    pub enum FeedbackDecision {
        Accept => "accept",
        Reject => "reject",
        Modify => "modify",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub seq: i64,
    pub workflow_id: String,
    pub operation: String,
    pub agent_name: Option<String>,
    pub duration_ms: i64,
    pub memory_mb: Option<f64>,
    pub api_calls: i64,
    pub tokens_used: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPerformanceMetric {
    pub workflow_id: String,
    pub operation: String,
    #[serde(default)]
    pub agent_name: Option<String>,
    pub duration_ms: i64,
    #[serde(default)]
    pub memory_mb: Option<f64>,
    #[serde(default)]
    pub api_calls: i64,
    #[serde(default)]
    pub tokens_used: i64,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

fn default_success() -> bool {
    true
}

impl NewPerformanceMetric {
    pub fn new(workflow_id: impl Into<String>, operation: impl Into<String>, duration_ms: i64) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            operation: operation.into(),
            agent_name: None,
            duration_ms,
            memory_mb: None,
            api_calls: 0,
            tokens_used: 0,
            success: true,
            error_message: None,
        }
    }

    pub fn agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = Some(agent_name.into());
        self
    }

    pub fn usage(mut self, api_calls: i64, tokens_used: i64) -> Self {
        self.api_calls = api_calls;
        self.tokens_used = tokens_used;
        self
    }

    pub fn failed(mut self, error_message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error_message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetric {
    pub seq: i64,
    pub analysis_id: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub category: QualityCategory,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionFeedback {
    pub seq: i64,
    pub suggestion_id: String,
    pub decision: FeedbackDecision,
    pub source: String,
    pub score: f64,
    pub reasoning: Option<String>,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFeedback {
    pub suggestion_id: String,
    pub decision: FeedbackDecision,
    pub source: String,
    pub score: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl NewFeedback {
    pub fn new(
        suggestion_id: impl Into<String>,
        decision: FeedbackDecision,
        source: impl Into<String>,
        score: f64,
    ) -> Self {
        Self {
            suggestion_id: suggestion_id.into(),
            decision,
            source: source.into(),
            score,
            reasoning: None,
            metadata: None,
        }
    }

    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Aggregated timings for one operation name within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation: String,
    pub calls: i64,
    pub failures: i64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: i64,
    pub total_api_calls: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub workflow_id: String,
    pub total_duration_ms: i64,
    pub total_api_calls: i64,
    pub total_tokens: i64,
    pub success_rate: Option<f64>,
    pub operations: Vec<OperationSummary>,
}

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    db: Database,
}

impl MetricsCollector {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record timing and usage for one agent operation
    pub async fn record_metric(&self, new: NewPerformanceMetric) -> Result<PerformanceMetric> {
        self.db
            .write(move |tx, clock| {
                let workflow_pk = require_workflow(tx, &new.workflow_id)?;
                let created_at = clock.now();
                tx.execute(
                    "INSERT INTO performance_metrics (workflow_state_id, operation, agent_name,
                        duration_ms, memory_mb, api_calls, tokens_used, success, error_message, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        workflow_pk,
                        new.operation,
                        new.agent_name,
                        new.duration_ms,
                        new.memory_mb,
                        new.api_calls,
                        new.tokens_used,
                        new.success,
                        new.error_message,
                        created_at,
                    ],
                )?;

                tracing::debug!(
                    "Workflow {}: {} took {}ms",
                    new.workflow_id,
                    new.operation,
                    new.duration_ms
                );
                Ok(PerformanceMetric {
                    seq: tx.last_insert_rowid(),
                    workflow_id: new.workflow_id,
                    operation: new.operation,
                    agent_name: new.agent_name,
                    duration_ms: new.duration_ms,
                    memory_mb: new.memory_mb,
                    api_calls: new.api_calls,
                    tokens_used: new.tokens_used,
                    success: new.success,
                    error_message: new.error_message,
                    created_at,
                })
            })
            .await
    }

    pub async fn record_quality_metric(
        &self,
        analysis_id: &str,
        metric_name: &str,
        metric_value: f64,
        category: QualityCategory,
    ) -> Result<QualityMetric> {
        let analysis_id = analysis_id.to_string();
        let metric_name = metric_name.to_string();
        self.db
            .write(move |tx, clock| {
                if !row_exists(tx, "code_analyses", &analysis_id)? {
                    return Err(StoreError::UnknownParent {
                        parent: "analysis",
                        id: analysis_id,
                    });
                }
                let created_at = clock.now();
                tx.execute(
                    "INSERT INTO quality_metrics (analysis_id, metric_name, metric_value, category, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![analysis_id, metric_name, metric_value, category, created_at],
                )?;
                Ok(QualityMetric {
                    seq: tx.last_insert_rowid(),
                    analysis_id,
                    metric_name,
                    metric_value,
                    category,
                    created_at,
                })
            })
            .await
    }

    /// Record a review verdict on a suggestion. The score must lie in [0, 1].
    pub async fn record_feedback(&self, new: NewFeedback) -> Result<SuggestionFeedback> {
        StoreError::check_score("score", new.score)?;
        self.db
            .write(move |tx, clock| {
                if !row_exists(tx, "suggestions", &new.suggestion_id)? {
                    return Err(StoreError::UnknownParent {
                        parent: "suggestion",
                        id: new.suggestion_id,
                    });
                }
                let created_at = clock.now();
                tx.execute(
                    "INSERT INTO suggestion_feedback (suggestion_id, decision, source, score,
                        reasoning, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        new.suggestion_id,
                        new.decision,
                        new.source,
                        new.score,
                        new.reasoning,
                        new.metadata,
                        created_at,
                    ],
                )?;

                tracing::debug!(
                    "Feedback on suggestion {}: {} ({})",
                    new.suggestion_id,
                    new.decision,
                    new.score
                );
                Ok(SuggestionFeedback {
                    seq: tx.last_insert_rowid(),
                    suggestion_id: new.suggestion_id,
                    decision: new.decision,
                    source: new.source,
                    score: new.score,
                    reasoning: new.reasoning,
                    metadata: new.metadata,
                    created_at,
                })
            })
            .await
    }

    /// Metrics of a workflow in recording order, optionally for one operation
    pub async fn metrics_for_workflow(
        &self,
        workflow_id: &str,
        operation: Option<&str>,
    ) -> Result<Vec<PerformanceMetric>> {
        let workflow_id = workflow_id.to_string();
        let operation = operation.map(str::to_string);
        self.db
            .read(move |conn| {
                let workflow_pk = require_workflow(conn, &workflow_id)?;
                let mut sql = String::from(
                    "SELECT m.id, w.workflow_id, m.operation, m.agent_name, m.duration_ms, m.memory_mb,
                            m.api_calls, m.tokens_used, m.success, m.error_message, m.created_at
                     FROM performance_metrics m JOIN workflow_states w ON w.id = m.workflow_state_id
                     WHERE m.workflow_state_id = ?",
                );
                let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(workflow_pk)];
                if let Some(operation) = operation {
                    sql.push_str(" AND m.operation = ?");
                    params.push(Box::new(operation));
                }
                sql.push_str(" ORDER BY m.id");

                let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let metrics = stmt
                    .query_map(params_refs.as_slice(), map_metric)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(metrics)
            })
            .await
    }

    /// Totals for a workflow, broken down by operation
    pub async fn performance_summary(&self, workflow_id: &str) -> Result<PerformanceSummary> {
        let workflow_id = workflow_id.to_string();
        self.db
            .read(move |conn| {
                let workflow_pk = require_workflow(conn, &workflow_id)?;

                let mut stmt = conn.prepare(
                    "SELECT operation, COUNT(*), SUM(CASE WHEN success THEN 0 ELSE 1 END),
                            AVG(duration_ms), MAX(duration_ms), SUM(api_calls), SUM(tokens_used)
                     FROM performance_metrics WHERE workflow_state_id = ?1
                     GROUP BY operation ORDER BY operation",
                )?;
                let operations = stmt
                    .query_map(params![workflow_pk], |row| {
                        Ok(OperationSummary {
                            operation: row.get(0)?,
                            calls: row.get(1)?,
                            failures: row.get(2)?,
                            avg_duration_ms: row.get(3)?,
                            max_duration_ms: row.get(4)?,
                            total_api_calls: row.get(5)?,
                            total_tokens: row.get(6)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let calls: i64 = operations.iter().map(|o| o.calls).sum();
                let failures: i64 = operations.iter().map(|o| o.failures).sum();
                let success_rate = (calls > 0).then(|| (calls - failures) as f64 / calls as f64);
                let total_duration_ms = conn.query_row(
                    "SELECT COALESCE(SUM(duration_ms), 0) FROM performance_metrics WHERE workflow_state_id = ?1",
                    params![workflow_pk],
                    |row| row.get(0),
                )?;

                Ok(PerformanceSummary {
                    workflow_id,
                    total_duration_ms,
                    total_api_calls: operations.iter().map(|o| o.total_api_calls).sum(),
                    total_tokens: operations.iter().map(|o| o.total_tokens).sum(),
                    success_rate,
                    operations,
                })
            })
            .await
    }

    pub async fn quality_metrics(
        &self,
        analysis_id: &str,
        category: Option<QualityCategory>,
    ) -> Result<Vec<QualityMetric>> {
        let analysis_id = analysis_id.to_string();
        self.db
            .read(move |conn| {
                if !row_exists(conn, "code_analyses", &analysis_id)? {
                    return Err(StoreError::UnknownParent {
                        parent: "analysis",
                        id: analysis_id,
                    });
                }
                let mut sql = String::from(
                    "SELECT id, analysis_id, metric_name, metric_value, category, created_at
                     FROM quality_metrics WHERE analysis_id = ?",
                );
                let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(analysis_id)];
                if let Some(category) = category {
                    sql.push_str(" AND category = ?");
                    params.push(Box::new(category));
                }
                sql.push_str(" ORDER BY id");

                let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
                let mut stmt = conn.prepare(&sql)?;
                let metrics = stmt
                    .query_map(params_refs.as_slice(), |row| {
                        Ok(QualityMetric {
                            seq: row.get(0)?,
                            analysis_id: row.get(1)?,
                            metric_name: row.get(2)?,
                            metric_value: row.get(3)?,
                            category: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(metrics)
            })
            .await
    }

    pub async fn feedback_for_suggestion(&self, suggestion_id: &str) -> Result<Vec<SuggestionFeedback>> {
        let suggestion_id = suggestion_id.to_string();
        self.db
            .read(move |conn| {
                if !row_exists(conn, "suggestions", &suggestion_id)? {
                    return Err(StoreError::UnknownParent {
                        parent: "suggestion",
                        id: suggestion_id,
                    });
                }
                let mut stmt = conn.prepare(
                    "SELECT id, suggestion_id, decision, source, score, reasoning, metadata, created_at
                     FROM suggestion_feedback WHERE suggestion_id = ?1 ORDER BY id",
                )?;
                let feedback = stmt
                    .query_map(params![suggestion_id], map_feedback)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(feedback)
            })
            .await
    }

    /// Mean feedback score, `None` when nobody has reviewed the suggestion yet
    pub async fn mean_feedback_score(&self, suggestion_id: &str) -> Result<Option<f64>> {
        let suggestion_id = suggestion_id.to_string();
        self.db
            .read(move |conn| {
                if !row_exists(conn, "suggestions", &suggestion_id)? {
                    return Err(StoreError::UnknownParent {
                        parent: "suggestion",
                        id: suggestion_id,
                    });
                }
                let mean: Option<f64> = conn.query_row(
                    "SELECT AVG(score) FROM suggestion_feedback WHERE suggestion_id = ?1",
                    params![suggestion_id],
                    |row| row.get(0),
                )?;
                Ok(mean)
            })
            .await
    }
}

fn require_workflow(conn: &Connection, workflow_id: &str) -> Result<String> {
    workflow::resolve(conn, workflow_id)?.ok_or_else(|| StoreError::UnknownParent {
        parent: "workflow",
        id: workflow_id.to_string(),
    })
}

fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1", table);
    let found: Option<i64> = conn.query_row(&sql, params![id], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

fn map_metric(row: &Row) -> rusqlite::Result<PerformanceMetric> {
    Ok(PerformanceMetric {
        seq: row.get(0)?,
        workflow_id: row.get(1)?,
        operation: row.get(2)?,
        agent_name: row.get(3)?,
        duration_ms: row.get(4)?,
        memory_mb: row.get(5)?,
        api_calls: row.get(6)?,
        tokens_used: row.get(7)?,
        success: row.get(8)?,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn map_feedback(row: &Row) -> rusqlite::Result<SuggestionFeedback> {
    Ok(SuggestionFeedback {
        seq: row.get(0)?,
        suggestion_id: row.get(1)?,
        decision: row.get(2)?,
        source: row.get(3)?,
        score: row.get(4)?,
        reasoning: row.get(5)?,
        metadata: row.get(6)?,
        created_at: row.get(7)?,
    })
}
