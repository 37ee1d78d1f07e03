//! The store facade handed to the RPC server and the CLI

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db::repositories::{
    AnalysisStore, AuditLog, MetricsCollector, RepositoryStore, SuggestionStore, SummaryViews,
    WorkflowStore,
};
use crate::db::{Clock, Database, PoolOptions, SystemClock};
use crate::error::Result;

/// Every repository over one shared database
#[derive(Debug, Clone)]
pub struct Store {
    pub db: Database,
    pub repositories: RepositoryStore,
    pub analyses: AnalysisStore,
    pub suggestions: SuggestionStore,
    pub workflows: WorkflowStore,
    pub audit: AuditLog,
    pub metrics: MetricsCollector,
    pub summaries: SummaryViews,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            repositories: RepositoryStore::new(db.clone()),
            analyses: AnalysisStore::new(db.clone()),
            suggestions: SuggestionStore::new(db.clone()),
            workflows: WorkflowStore::new(db.clone()),
            audit: AuditLog::new(db.clone()),
            metrics: MetricsCollector::new(db.clone()),
            summaries: SummaryViews::new(db.clone()),
            db,
        }
    }

    /// Open the database at `path` with default pool settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(Database::new(path)?))
    }

    /// Open the database described by a loaded configuration
    pub fn from_config(config: &Config, database_path: &Path) -> Result<Self> {
        let options = PoolOptions {
            max_size: config.pool.max_size,
            busy_timeout_ms: config.pool.busy_timeout_ms,
            connection_timeout_secs: config.pool.connection_timeout_secs,
        };
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let db = Database::open_with(database_path, options, clock)?;
        let mut store = Self::new(db);
        store.audit = store.audit.with_page_size(config.audit_page_size);
        Ok(store)
    }
}
