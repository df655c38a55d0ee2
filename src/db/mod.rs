//! SQLite storage for the progression engine
//!
//! ## Architecture
//!
//! - Schema is created and versioned through rusqlite before the pool opens
//! - All queries run through diesel over an r2d2 pool
//! - Every pooled connection sets `busy_timeout` and `foreign_keys`
//! - Writes run in `BEGIN IMMEDIATE` transactions, which take SQLite's
//!   write lock up front; read-check-write sequences inside them cannot
//!   interleave with another writer
//!
//! ## Tables
//!
//! - `progression_nodes`, `progression_prerequisites`, `progression_unlocks` - unlock graph
//! - `progression_voting_sessions`, `progression_voting_options`, `progression_user_votes` - voting
//! - `progression_unlock_progress` - contribution cycle chain
//! - `engagement_metrics`, `engagement_weights` - engagement ledger
//! - `progression_resets`, `user_progression`, `progression_sync_metadata` - admin/bookkeeping

pub mod context;
pub mod diesel_schema;
pub mod engagement;
pub mod models;
pub mod nodes;
pub mod progress;
pub mod reset;
pub mod schema;
pub mod sync_metadata;
pub mod user_progression;
pub mod voting;

use std::path::{Path, PathBuf};
use std::time::Duration;

use diesel::connection::{AnsiTransactionManager, SimpleConnection, TransactionManager};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ProgressionError;

pub use context::OpContext;
pub use models::*;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas applied whenever the pool hands out a new connection
#[derive(Debug, Clone, Copy)]
struct ConnectionPragmas {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Run `f` under SQLite's write lock.
///
/// Opens a `BEGIN IMMEDIATE` transaction on a bare connection. Inside an
/// enclosing transaction (one opened by `ProgressionDb::write`) the lock is
/// already held, so `f` runs in a savepoint instead.
pub fn with_write_lock<T, F>(conn: &mut SqliteConnection, f: F) -> Result<T, ProgressionError>
where
    F: FnOnce(&mut SqliteConnection) -> Result<T, ProgressionError>,
{
    let status =
        <AnsiTransactionManager as TransactionManager<SqliteConnection>>::transaction_manager_status_mut(
            conn,
        );
    let depth = status
        .transaction_depth()
        .map_err(|e| ProgressionError::Internal(format!("Transaction state unavailable: {}", e)))?;

    match depth {
        Some(_) => diesel::Connection::transaction(conn, f),
        None => conn.immediate_transaction(f),
    }
}

/// Pooled progression database
#[derive(Clone)]
pub struct ProgressionDb {
    pool: DbPool,
    path: PathBuf,
}

impl ProgressionDb {
    /// Open or create the database described by `config`
    pub fn open(config: &Config) -> Result<Self, ProgressionError> {
        std::fs::create_dir_all(&config.storage_dir)?;
        Self::open_path(
            &config.db_path(),
            config.pool_size,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    /// Open or create the database file at `path`
    pub fn open_path(
        path: &Path,
        pool_size: u32,
        busy_timeout: Duration,
    ) -> Result<Self, ProgressionError> {
        info!("Opening progression database at {:?}", path);

        {
            let conn = Connection::open(path)
                .map_err(|e| ProgressionError::Internal(format!("Failed to open SQLite: {}", e)))?;

            // WAL is persistent per file; set once before pooled connections attach
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
                .map_err(|e| ProgressionError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

            schema::init_schema(&conn)?;
        }

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(busy_timeout.max(Duration::from_secs(1)))
            .connection_customizer(Box::new(ConnectionPragmas {
                busy_timeout_ms: busy_timeout.as_millis() as u64,
            }))
            .build(manager)
            .map_err(|e| ProgressionError::Pool(format!("Failed to build pool: {}", e)))?;

        debug!(pool_size, "Progression database pool ready");

        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<PooledConn, ProgressionError> {
        self.pool
            .get()
            .map_err(|e| ProgressionError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Run a read on a pooled connection
    pub fn read<T, F>(&self, ctx: &OpContext, operation: &str, f: F) -> Result<T, ProgressionError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, ProgressionError>,
    {
        ctx.check(operation)?;
        let mut conn = self.conn()?;
        f(&mut conn)
    }

    /// Run `f` inside one `BEGIN IMMEDIATE` transaction.
    ///
    /// The context is checked before the transaction opens and again right
    /// before commit; a cancelled or expired request rolls back.
    pub fn write<T, F>(&self, ctx: &OpContext, operation: &str, f: F) -> Result<T, ProgressionError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, ProgressionError>,
    {
        ctx.check(operation)?;
        let mut pooled = self.conn()?;
        let conn: &mut SqliteConnection = &mut pooled;

        let result = conn.immediate_transaction(|conn| {
            let value = f(conn)?;
            ctx.check(operation)?;
            Ok(value)
        });

        if let Err(e) = &result {
            debug!(request_id = %ctx.request_id, operation, error = %e, "Write rolled back");
        }
        result
    }

    /// Get database statistics
    pub fn stats(&self, ctx: &OpContext) -> Result<DbStats, ProgressionError> {
        use diesel_schema::{
            engagement_metrics, progression_nodes, progression_unlocks,
            progression_voting_sessions,
        };

        self.read(ctx, "stats", |conn| {
            let node_count: i64 = progression_nodes::table
                .count()
                .get_result(conn)
                .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;

            let unlock_count: i64 = progression_unlocks::table
                .count()
                .get_result(conn)
                .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;

            let session_count: i64 = progression_voting_sessions::table
                .count()
                .get_result(conn)
                .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;

            let metric_count: i64 = engagement_metrics::table
                .count()
                .get_result(conn)
                .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))?;

            Ok(DbStats {
                node_count: node_count as u64,
                unlock_count: unlock_count as u64,
                session_count: session_count as u64,
                metric_count: metric_count as u64,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub node_count: u64,
    pub unlock_count: u64,
    pub session_count: u64,
    pub metric_count: u64,
}

/// Open a database in a temporary directory
#[cfg(test)]
pub(crate) fn test_db() -> (tempfile::TempDir, ProgressionDb) {
    let dir = tempfile::tempdir().unwrap();
    let db = ProgressionDb::open_path(&dir.path().join("test.db"), 4, Duration::from_secs(5))
        .unwrap();
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_stats() {
        let (_dir, db) = test_db();
        let stats = db.stats(&OpContext::new()).unwrap();
        assert_eq!(stats.node_count, 0);
        assert_eq!(stats.unlock_count, 0);
    }

    #[test]
    fn test_reopen_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        drop(ProgressionDb::open_path(&path, 2, Duration::from_secs(1)).unwrap());
        let db = ProgressionDb::open_path(&path, 2, Duration::from_secs(1)).unwrap();
        assert_eq!(db.path(), path.as_path());
    }

    #[test]
    fn test_cancelled_write_rolls_back() {
        use diesel_schema::engagement_metrics;

        let (_dir, db) = test_db();
        let ctx = OpContext::new();
        let inner = ctx.clone();

        let result = db.write(&ctx, "record", |conn| {
            let now = current_timestamp();
            diesel::insert_into(engagement_metrics::table)
                .values(&NewEngagementMetric {
                    user_id: "alice",
                    metric_type: "message",
                    metric_value: 1,
                    metadata: None,
                    recorded_at: &now,
                })
                .execute(conn)?;
            inner.cancel();
            Ok(())
        });

        assert!(matches!(result, Err(ProgressionError::Cancelled(_))));
        assert_eq!(db.stats(&OpContext::new()).unwrap().metric_count, 0);
    }
}
