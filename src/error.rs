//! Error types for the workflow ledger store

use thiserror::Error;

/// Result type alias using the store error
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors reported at the store boundary.
///
/// Only [`StoreError::TransactionConflict`] is transient; every other variant
/// means the caller asked for something the store will not do.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Duplicate key: {entity} '{key}' already exists")]
    DuplicateKey { entity: &'static str, key: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Unknown {parent}: {id}")]
    UnknownParent { parent: &'static str, id: String },

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Invalid progress: {requested} (current {current})")]
    InvalidProgress { current: f64, requested: f64 },

    #[error("Invalid {field}: {value} is outside [0.0, 1.0]")]
    InvalidScore { field: &'static str, value: f64 },

    #[error("Repository {repository_id} already has active workflow {active_workflow}")]
    WorkflowAlreadyActive {
        repository_id: String,
        active_workflow: String,
    },

    #[error("{entity} {id} is {status} and can no longer be modified")]
    Immutable {
        entity: &'static str,
        id: String,
        status: String,
    },

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl StoreError {
    /// Whether a caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TransactionConflict(_))
    }

    /// Stable machine-readable code for this error kind
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::DuplicateKey { .. } => "DUPLICATE_KEY",
            StoreError::NotFound { .. } => "NOT_FOUND",
            StoreError::ForeignKeyViolation(_) => "FOREIGN_KEY_VIOLATION",
            StoreError::UnknownWorkflow(_) => "UNKNOWN_WORKFLOW",
            StoreError::UnknownParent { .. } => "UNKNOWN_PARENT",
            StoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            StoreError::InvalidProgress { .. } => "INVALID_PROGRESS",
            StoreError::InvalidScore { .. } => "INVALID_SCORE",
            StoreError::WorkflowAlreadyActive { .. } => "WORKFLOW_ALREADY_ACTIVE",
            StoreError::Immutable { .. } => "IMMUTABLE",
            StoreError::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            StoreError::Database(_) => "DATABASE",
            StoreError::Pool(_) => "POOL",
            StoreError::Serde(_) => "SERIALIZATION",
            StoreError::Io(_) => "IO",
            StoreError::Task(_) => "TASK",
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Check that a score lies in the closed unit interval.
    pub(crate) fn check_score(field: &'static str, value: f64) -> Result<()> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(StoreError::InvalidScore { field, value })
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::TransactionConflict(
                    msg.clone().unwrap_or_else(|| "database is locked".to_string()),
                )
            }
            rusqlite::Error::SqliteFailure(e, msg)
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                StoreError::ForeignKeyViolation(
                    msg.clone().unwrap_or_else(|| "FOREIGN KEY constraint failed".to_string()),
                )
            }
            _ => StoreError::Database(err),
        }
    }
}

/// Message of a UNIQUE constraint failure, e.g.
/// `UNIQUE constraint failed: repositories.url`.
pub(crate) fn unique_violation(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg))
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            Some(msg.as_str())
        }
        _ => None,
    }
}
