//! Database connection management
//!
//! SQLite in WAL mode behind an r2d2 pool. Every write runs as one
//! `BEGIN IMMEDIATE` transaction on tokio's blocking pool, so conflicting
//! writers queue on SQLite's write lock (bounded by `busy_timeout`) and
//! readers only ever see committed rows.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::info;

use super::schema::SCHEMA;
use super::stamp::{Clock, SystemClock};
use crate::error::{Result, StoreError};

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_size: u32,
    pub busy_timeout_ms: u64,
    pub connection_timeout_secs: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 8,
            busy_timeout_ms: 5_000,
            connection_timeout_secs: 30,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    clock: Arc<dyn Clock>,
    path: String,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Database {
    /// Open (or create) a database file with default pool settings
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, PoolOptions::default(), Arc::new(SystemClock))
    }

    /// Open a database file with explicit pool settings and clock
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        options: PoolOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let busy_timeout_ms = options.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(path)
            .with_init(move |conn| Self::configure_connection(conn, busy_timeout_ms));

        let pool = Pool::builder()
            .max_size(options.max_size.max(1))
            .connection_timeout(Duration::from_secs(options.connection_timeout_secs))
            .build(manager)?;

        let db = Self {
            pool,
            clock,
            path: path.to_string_lossy().to_string(),
        };
        db.initialize()?;

        info!("Database initialized at {:?}", path);
        Ok(db)
    }

    /// Single-connection in-memory database, for tools and quick tests
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn open_in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

        let pool = Pool::builder().max_size(1).build(manager)?;

        let db = Self {
            pool,
            clock,
            path: ":memory:".to_string(),
        };
        db.initialize()?;
        Ok(db)
    }

    fn configure_connection(conn: &mut Connection, busy_timeout_ms: u64) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
        Ok(())
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        checkout(&self.pool)
    }

    /// Get the database path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Clock used for every timestamp this store writes
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run a read-only closure on a pooled connection.
    pub async fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = checkout(&pool)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Run a closure inside one IMMEDIATE transaction.
    ///
    /// Commits when the closure returns `Ok`; any error rolls everything back.
    pub async fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>, &dyn Clock) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let clock = Arc::clone(&self.clock);
        tokio::task::spawn_blocking(move || {
            let mut conn = checkout(&pool)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx, clock.as_ref())?;
            tx.commit()?;
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Check if database is accessible (for health checks)
    pub async fn health_check(&self) -> Result<bool> {
        let probe = self
            .read(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?))
            .await;
        match probe {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// Take a connection from the pool.
///
/// `Pool::get` only fails once `connection_timeout` elapses with every
/// connection checked out, which is contention like a busy write lock.
fn checkout(
    pool: &Pool<SqliteConnectionManager>,
) -> Result<PooledConnection<SqliteConnectionManager>> {
    pool.get()
        .map_err(|e| StoreError::TransactionConflict(format!("connection pool exhausted: {}", e)))
}
