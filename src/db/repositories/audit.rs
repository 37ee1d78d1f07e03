//! Append-only audit trail: agent interactions and context snapshots
//!
//! Rows are ordered by their sequence id. Timestamps within one workflow's
//! log never go backwards, even if the clock does: a new row is stamped with
//! the later of "now" and the previous row's timestamp.
//!
//! Reads are lazy streams that page through the log oldest-first. A stream
//! stops at the newest row that existed when its first page was fetched;
//! calling `stream()` again starts over.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::workflow;
use crate::db::stamp::monotonic;
use crate::db::Database;
use crate::error::{Result, StoreError};

pub const DEFAULT_PAGE_SIZE: usize = 256;

text_enum! {
    pub enum InteractionType {
        Handoff => "handoff",
        Feedback => "feedback",
        Query => "query",
        Result => "result",
    }
}

text_enum! {
    pub enum ContextType {
        AnalysisState => "analysis_state",
        SuggestionSet => "suggestion_set",
        RepositoryState => "repository_state",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInteraction {
    pub seq: i64,
    pub workflow_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub interaction_type: InteractionType,
    pub content: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInteraction {
    pub workflow_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub interaction_type: InteractionType,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl NewInteraction {
    pub fn new(
        workflow_id: impl Into<String>,
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        interaction_type: InteractionType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            interaction_type,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub seq: i64,
    pub workflow_id: String,
    pub agent_name: String,
    pub context_type: ContextType,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    db: Database,
    page_size: usize,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Append one agent-to-agent message
    pub async fn record_interaction(&self, new: NewInteraction) -> Result<AgentInteraction> {
        self.db
            .write(move |tx, clock| {
                let workflow_pk = workflow::resolve(tx, &new.workflow_id)?
                    .ok_or_else(|| StoreError::UnknownWorkflow(new.workflow_id.clone()))?;

                let last: Option<DateTime<Utc>> = tx
                    .query_row(
                        "SELECT created_at FROM agent_interactions
                         WHERE workflow_state_id = ?1 ORDER BY id DESC LIMIT 1",
                        params![workflow_pk],
                        |row| row.get(0),
                    )
                    .optional()?;
                let created_at = monotonic(clock.now(), last);

                tx.execute(
                    "INSERT INTO agent_interactions (workflow_state_id, from_agent, to_agent,
                        interaction_type, content, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        workflow_pk,
                        new.from_agent,
                        new.to_agent,
                        new.interaction_type,
                        new.content,
                        new.metadata,
                        created_at,
                    ],
                )?;

                let interaction = AgentInteraction {
                    seq: tx.last_insert_rowid(),
                    workflow_id: new.workflow_id,
                    from_agent: new.from_agent,
                    to_agent: new.to_agent,
                    interaction_type: new.interaction_type,
                    content: new.content,
                    metadata: new.metadata,
                    created_at,
                };
                tracing::debug!(
                    "Workflow {}: {} -> {} ({})",
                    interaction.workflow_id,
                    interaction.from_agent,
                    interaction.to_agent,
                    interaction.interaction_type
                );
                Ok(interaction)
            })
            .await
    }

    /// Append a snapshot of an agent's working context
    pub async fn record_snapshot(
        &self,
        workflow_id: &str,
        agent_name: &str,
        context_type: ContextType,
        data: Value,
    ) -> Result<ContextSnapshot> {
        let workflow_id = workflow_id.to_string();
        let agent_name = agent_name.to_string();
        self.db
            .write(move |tx, clock| {
                let workflow_pk = workflow::resolve(tx, &workflow_id)?
                    .ok_or_else(|| StoreError::UnknownWorkflow(workflow_id.clone()))?;

                let last: Option<DateTime<Utc>> = tx
                    .query_row(
                        "SELECT created_at FROM context_snapshots
                         WHERE workflow_state_id = ?1 ORDER BY id DESC LIMIT 1",
                        params![workflow_pk],
                        |row| row.get(0),
                    )
                    .optional()?;
                let created_at = monotonic(clock.now(), last);

                tx.execute(
                    "INSERT INTO context_snapshots (workflow_state_id, agent_name, context_type,
                        context_data, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![workflow_pk, agent_name, context_type, data, created_at],
                )?;

                tracing::debug!("Workflow {}: {} snapshot from {}", workflow_id, context_type, agent_name);
                Ok(ContextSnapshot {
                    seq: tx.last_insert_rowid(),
                    workflow_id,
                    agent_name,
                    context_type,
                    data,
                    created_at,
                })
            })
            .await
    }

    /// Interactions of a workflow, oldest first
    pub fn interactions(&self, workflow_id: &str) -> InteractionQuery {
        InteractionQuery {
            db: self.db.clone(),
            filter: InteractionFilter {
                workflow_id: workflow_id.to_string(),
                agent: None,
                interaction_type: None,
            },
            page_size: self.page_size,
        }
    }

    /// Context snapshots of a workflow, oldest first
    pub fn snapshots(&self, workflow_id: &str) -> SnapshotQuery {
        SnapshotQuery {
            db: self.db.clone(),
            filter: SnapshotFilter {
                workflow_id: workflow_id.to_string(),
                agent: None,
                context_type: None,
            },
            page_size: self.page_size,
        }
    }

    /// Most recent snapshot an agent left of the given kind, for resuming work
    pub async fn latest_snapshot(
        &self,
        workflow_id: &str,
        agent_name: &str,
        context_type: ContextType,
    ) -> Result<Option<ContextSnapshot>> {
        let workflow_id = workflow_id.to_string();
        let agent_name = agent_name.to_string();
        self.db
            .read(move |conn| {
                let workflow_pk = workflow::resolve(conn, &workflow_id)?
                    .ok_or_else(|| StoreError::UnknownWorkflow(workflow_id.clone()))?;
                Ok(conn
                    .query_row(
                        "SELECT s.id, w.workflow_id, s.agent_name, s.context_type, s.context_data, s.created_at
                         FROM context_snapshots s JOIN workflow_states w ON w.id = s.workflow_state_id
                         WHERE s.workflow_state_id = ?1 AND s.agent_name = ?2 AND s.context_type = ?3
                         ORDER BY s.id DESC LIMIT 1",
                        params![workflow_pk, agent_name, context_type],
                        map_snapshot,
                    )
                    .optional()?)
            })
            .await
    }
}

#[derive(Debug, Clone)]
struct InteractionFilter {
    workflow_id: String,
    agent: Option<String>,
    interaction_type: Option<InteractionType>,
}

/// Restartable read over a workflow's interactions
#[derive(Debug, Clone)]
pub struct InteractionQuery {
    db: Database,
    filter: InteractionFilter,
    page_size: usize,
}

impl InteractionQuery {
    /// Only interactions sent or received by `agent`
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.filter.agent = Some(agent.into());
        self
    }

    pub fn kind(mut self, interaction_type: InteractionType) -> Self {
        self.filter.interaction_type = Some(interaction_type);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn stream(&self) -> BoxStream<'static, Result<AgentInteraction>> {
        let filter = self.filter.clone();
        paged(self.db.clone(), self.page_size, move |conn, after, upper, limit| {
            interaction_page(conn, &filter, after, upper, limit)
        })
    }

    pub async fn collect(&self) -> Result<Vec<AgentInteraction>> {
        self.stream().try_collect().await
    }
}

#[derive(Debug, Clone)]
struct SnapshotFilter {
    workflow_id: String,
    agent: Option<String>,
    context_type: Option<ContextType>,
}

/// Restartable read over a workflow's context snapshots
#[derive(Debug, Clone)]
pub struct SnapshotQuery {
    db: Database,
    filter: SnapshotFilter,
    page_size: usize,
}

impl SnapshotQuery {
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.filter.agent = Some(agent.into());
        self
    }

    pub fn context_type(mut self, context_type: ContextType) -> Self {
        self.filter.context_type = Some(context_type);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn stream(&self) -> BoxStream<'static, Result<ContextSnapshot>> {
        let filter = self.filter.clone();
        paged(self.db.clone(), self.page_size, move |conn, after, upper, limit| {
            snapshot_page(conn, &filter, after, upper, limit)
        })
    }

    pub async fn collect(&self) -> Result<Vec<ContextSnapshot>> {
        self.stream().try_collect().await
    }
}

/// One page of rows with their sequence ids, plus the stream's upper bound
type Page<T> = (Vec<(i64, T)>, i64);

#[derive(Debug, Clone, Copy)]
struct Cursor {
    after: i64,
    upper: Option<i64>,
    done: bool,
}

fn paged<T, F>(db: Database, page_size: usize, fetch: F) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    F: Fn(&Connection, i64, Option<i64>, usize) -> Result<Page<T>> + Clone + Send + Sync + 'static,
{
    let start = Cursor {
        after: 0,
        upper: None,
        done: false,
    };

    stream::try_unfold(start, move |cursor| {
        let db = db.clone();
        let fetch = fetch.clone();
        async move {
            if cursor.done {
                return Ok::<_, StoreError>(None);
            }
            let (rows, upper) = db
                .read(move |conn| fetch(conn, cursor.after, cursor.upper, page_size))
                .await?;
            let Some(last_seq) = rows.last().map(|(seq, _)| *seq) else {
                return Ok(None);
            };
            let next = Cursor {
                after: last_seq,
                upper: Some(upper),
                done: rows.len() < page_size,
            };
            let items: Vec<T> = rows.into_iter().map(|(_, item)| item).collect();
            Ok(Some((items, next)))
        }
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, StoreError>)))
    .try_flatten()
    .boxed()
}

fn resolve_bounds(
    conn: &Connection,
    table: &str,
    workflow_id: &str,
    upper: Option<i64>,
) -> Result<(String, i64)> {
    let workflow_pk = workflow::resolve(conn, workflow_id)?
        .ok_or_else(|| StoreError::UnknownWorkflow(workflow_id.to_string()))?;
    let upper = match upper {
        Some(upper) => upper,
        None => conn.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {} WHERE workflow_state_id = ?1", table),
            params![workflow_pk],
            |row| row.get(0),
        )?,
    };
    Ok((workflow_pk, upper))
}

fn interaction_page(
    conn: &Connection,
    filter: &InteractionFilter,
    after: i64,
    upper: Option<i64>,
    limit: usize,
) -> Result<Page<AgentInteraction>> {
    let (workflow_pk, upper) = resolve_bounds(conn, "agent_interactions", &filter.workflow_id, upper)?;

    let mut sql = String::from(
        "SELECT i.id, w.workflow_id, i.from_agent, i.to_agent, i.interaction_type, i.content,
                i.metadata, i.created_at
         FROM agent_interactions i JOIN workflow_states w ON w.id = i.workflow_state_id
         WHERE i.workflow_state_id = ? AND i.id > ? AND i.id <= ?",
    );
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(workflow_pk), Box::new(after), Box::new(upper)];
    if let Some(agent) = &filter.agent {
        sql.push_str(" AND (i.from_agent = ? OR i.to_agent = ?)");
        params.push(Box::new(agent.clone()));
        params.push(Box::new(agent.clone()));
    }
    if let Some(kind) = filter.interaction_type {
        sql.push_str(" AND i.interaction_type = ?");
        params.push(Box::new(kind));
    }
    sql.push_str(" ORDER BY i.id LIMIT ?");
    params.push(Box::new(limit as i64));

    let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_refs.as_slice(), |row| {
            let interaction = map_interaction(row)?;
            Ok((interaction.seq, interaction))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((rows, upper))
}

fn snapshot_page(
    conn: &Connection,
    filter: &SnapshotFilter,
    after: i64,
    upper: Option<i64>,
    limit: usize,
) -> Result<Page<ContextSnapshot>> {
    let (workflow_pk, upper) = resolve_bounds(conn, "context_snapshots", &filter.workflow_id, upper)?;

    let mut sql = String::from(
        "SELECT s.id, w.workflow_id, s.agent_name, s.context_type, s.context_data, s.created_at
         FROM context_snapshots s JOIN workflow_states w ON w.id = s.workflow_state_id
         WHERE s.workflow_state_id = ? AND s.id > ? AND s.id <= ?",
    );
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(workflow_pk), Box::new(after), Box::new(upper)];
    if let Some(agent) = &filter.agent {
        sql.push_str(" AND s.agent_name = ?");
        params.push(Box::new(agent.clone()));
    }
    if let Some(context_type) = filter.context_type {
        sql.push_str(" AND s.context_type = ?");
        params.push(Box::new(context_type));
    }
    sql.push_str(" ORDER BY s.id LIMIT ?");
    params.push(Box::new(limit as i64));

    let params_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_refs.as_slice(), |row| {
            let snapshot = map_snapshot(row)?;
            Ok((snapshot.seq, snapshot))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((rows, upper))
}

fn map_interaction(row: &Row) -> rusqlite::Result<AgentInteraction> {
    Ok(AgentInteraction {
        seq: row.get(0)?,
        workflow_id: row.get(1)?,
        from_agent: row.get(2)?,
        to_agent: row.get(3)?,
        interaction_type: row.get(4)?,
        content: row.get(5)?,
        metadata: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn map_snapshot(row: &Row) -> rusqlite::Result<ContextSnapshot> {
    Ok(ContextSnapshot {
        seq: row.get(0)?,
        workflow_id: row.get(1)?,
        agent_name: row.get(2)?,
        context_type: row.get(3)?,
        data: row.get(4)?,
        created_at: row.get(5)?,
    })
}
