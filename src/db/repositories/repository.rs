//! Repository records: one row per source URL

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::stamp::{new_id, UpdateSet};
use crate::db::Database;
use crate::error::{unique_violation, Result, StoreError};

text_enum! {
    /// Progress of the local clone
    pub enum CloneStatus {
        Pending => "pending",
        Cloning => "cloning",
        Ready => "ready",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub url: String,
    pub name: String,
    pub owner: String,
    pub branch: String,
    pub local_path: Option<String>,
    pub clone_status: CloneStatus,
    pub description: Option<String>,
    pub language: Option<String>,
    pub size_kb: Option<i64>,
    pub file_count: Option<i64>,
    pub last_analyzed: Option<DateTime<Utc>>,
    pub complexity_summary: Option<Value>,
    pub dependency_summary: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRepository {
    pub url: String,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub size_kb: Option<i64>,
    #[serde(default)]
    pub file_count: Option<i64>,
}

impl NewRepository {
    pub fn new(url: impl Into<String>, name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            owner: owner.into(),
            ..Default::default()
        }
    }
}

/// Fields to change; `None` leaves a column as it is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryUpdate {
    pub name: Option<String>,
    pub owner: Option<String>,
    pub branch: Option<String>,
    pub local_path: Option<String>,
    pub clone_status: Option<CloneStatus>,
    pub description: Option<String>,
    pub language: Option<String>,
    pub size_kb: Option<i64>,
    pub file_count: Option<i64>,
    pub last_analyzed: Option<DateTime<Utc>>,
    pub complexity_summary: Option<Value>,
    pub dependency_summary: Option<Value>,
}

impl RepositoryUpdate {
    fn into_set(self) -> UpdateSet {
        let mut set = UpdateSet::new("repositories");
        set.set_opt("name", self.name)
            .set_opt("owner", self.owner)
            .set_opt("branch", self.branch)
            .set_opt("local_path", self.local_path)
            .set_opt("clone_status", self.clone_status)
            .set_opt("description", self.description)
            .set_opt("language", self.language)
            .set_opt("size_kb", self.size_kb)
            .set_opt("file_count", self.file_count)
            .set_opt("last_analyzed", self.last_analyzed)
            .set_opt("complexity_summary", self.complexity_summary)
            .set_opt("dependency_summary", self.dependency_summary);
        set
    }
}

const COLUMNS: &str = "id, url, name, owner, branch, local_path, clone_status, description,
    language, size_kb, file_count, last_analyzed, complexity_summary, dependency_summary,
    created_at, updated_at";

#[derive(Debug, Clone)]
pub struct RepositoryStore {
    db: Database,
}

impl RepositoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a repository by URL
    pub async fn create(&self, new: NewRepository) -> Result<Repository> {
        self.db
            .write(move |tx, clock| {
                let now = clock.now();
                let repo = Repository {
                    id: new_id(),
                    url: new.url,
                    name: new.name,
                    owner: new.owner,
                    branch: new.branch.unwrap_or_else(|| "main".to_string()),
                    local_path: new.local_path,
                    clone_status: CloneStatus::Pending,
                    description: new.description,
                    language: new.language,
                    size_kb: new.size_kb,
                    file_count: new.file_count,
                    last_analyzed: None,
                    complexity_summary: None,
                    dependency_summary: None,
                    created_at: now,
                    updated_at: now,
                };

                tx.execute(
                    "INSERT INTO repositories (id, url, name, owner, branch, local_path, clone_status,
                        description, language, size_kb, file_count, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        repo.id,
                        repo.url,
                        repo.name,
                        repo.owner,
                        repo.branch,
                        repo.local_path,
                        repo.clone_status,
                        repo.description,
                        repo.language,
                        repo.size_kb,
                        repo.file_count,
                        repo.created_at,
                        repo.updated_at,
                    ],
                )
                .map_err(|e| match unique_violation(&e) {
                    Some(_) => StoreError::DuplicateKey {
                        entity: "repository",
                        key: repo.url.clone(),
                    },
                    None => e.into(),
                })?;

                tracing::debug!("Created repository {} ({})", repo.id, repo.url);
                Ok(repo)
            })
            .await
    }

    /// Get a repository by ID
    pub async fn get(&self, id: &str) -> Result<Option<Repository>> {
        let id = id.to_string();
        self.db.read(move |conn| fetch(conn, &id)).await
    }

    /// Get a repository by its source URL
    pub async fn get_by_url(&self, url: &str) -> Result<Option<Repository>> {
        let url = url.to_string();
        self.db
            .read(move |conn| {
                let sql = format!("SELECT {} FROM repositories WHERE url = ?1", COLUMNS);
                Ok(conn.query_row(&sql, params![url], map_row).optional()?)
            })
            .await
    }

    pub async fn get_by_owner_name(&self, owner: &str, name: &str) -> Result<Option<Repository>> {
        let owner = owner.to_string();
        let name = name.to_string();
        self.db
            .read(move |conn| {
                let sql = format!(
                    "SELECT {} FROM repositories WHERE owner = ?1 AND name = ?2
                     ORDER BY created_at LIMIT 1",
                    COLUMNS
                );
                Ok(conn.query_row(&sql, params![owner, name], map_row).optional()?)
            })
            .await
    }

    /// List repositories, newest first
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<Repository>> {
        self.db
            .read(move |conn| {
                let sql = format!(
                    "SELECT {} FROM repositories ORDER BY created_at DESC, id LIMIT ?1 OFFSET ?2",
                    COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let repos = stmt
                    .query_map(params![limit as i64, offset as i64], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(repos)
            })
            .await
    }

    /// Repositories that have been analyzed, most recent first
    pub async fn recently_analyzed(&self, limit: usize) -> Result<Vec<Repository>> {
        self.db
            .read(move |conn| {
                let sql = format!(
                    "SELECT {} FROM repositories WHERE last_analyzed IS NOT NULL
                     ORDER BY last_analyzed DESC LIMIT ?1",
                    COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let repos = stmt
                    .query_map(params![limit as i64], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(repos)
            })
            .await
    }

    /// Apply a multi-field update as one mutation
    pub async fn update(&self, id: &str, update: RepositoryUpdate) -> Result<Repository> {
        let id = id.to_string();
        self.db
            .write(move |tx, clock| {
                let set = update.into_set();
                if set.is_empty() {
                    return fetch(tx, &id)?.ok_or_else(|| StoreError::not_found("repository", &id));
                }
                if set.apply(tx, &id, clock.now())? == 0 {
                    return Err(StoreError::not_found("repository", &id));
                }
                tracing::debug!("Updated repository {}", id);
                fetch(tx, &id)?.ok_or_else(|| StoreError::not_found("repository", &id))
            })
            .await
    }

    pub async fn update_clone_status(
        &self,
        id: &str,
        status: CloneStatus,
        local_path: Option<String>,
    ) -> Result<Repository> {
        self.update(
            id,
            RepositoryUpdate {
                clone_status: Some(status),
                local_path,
                ..Default::default()
            },
        )
        .await
    }

    /// Stamp `last_analyzed` with the current time
    pub async fn mark_analyzed(&self, id: &str) -> Result<Repository> {
        let now = self.db.clock().now();
        self.update(
            id,
            RepositoryUpdate {
                last_analyzed: Some(now),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a repository and everything that hangs off it
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .write(move |tx, _| {
                let (analyses, workflows): (i64, i64) = tx.query_row(
                    "SELECT
                        (SELECT COUNT(*) FROM code_analyses WHERE repository_id = ?1),
                        (SELECT COUNT(*) FROM workflow_states WHERE repository_id = ?1)",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;

                let deleted = tx.execute("DELETE FROM repositories WHERE id = ?1", params![id])?;
                if deleted == 0 {
                    return Err(StoreError::not_found("repository", &id));
                }

                tracing::info!(
                    "Deleted repository {} with {} analyses and {} workflows",
                    id,
                    analyses,
                    workflows
                );
                Ok(())
            })
            .await
    }
}

pub(crate) fn fetch(conn: &Connection, id: &str) -> Result<Option<Repository>> {
    let sql = format!("SELECT {} FROM repositories WHERE id = ?1", COLUMNS);
    Ok(conn.query_row(&sql, params![id], map_row).optional()?)
}

pub(crate) fn exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM repositories WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn map_row(row: &Row) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get("id")?,
        url: row.get("url")?,
        name: row.get("name")?,
        owner: row.get("owner")?,
        branch: row.get("branch")?,
        local_path: row.get("local_path")?,
        clone_status: row.get("clone_status")?,
        description: row.get("description")?,
        language: row.get("language")?,
        size_kb: row.get("size_kb")?,
        file_count: row.get("file_count")?,
        last_analyzed: row.get("last_analyzed")?,
        complexity_summary: row.get("complexity_summary")?,
        dependency_summary: row.get("dependency_summary")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
