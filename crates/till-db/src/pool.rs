//! # Local Store Handle
//!
//! Opens the terminal's SQLite file and hands out one repository per table
//! group. Everything the sync layer persists goes through [`Database`].
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Database (till.db)                              │
//! │                                                                         │
//! │   DbConfig ──► connect_options() + pool_options() ──► SqlitePool       │
//! │                                                         │               │
//! │                                migrations/sqlite ◄──────┤ on open       │
//! │                                                         │               │
//! │        ┌──────────────┬──────────────────┬──────────────┴──────┐       │
//! │        ▼              ▼                  ▼                     ▼       │
//! │   cache()        mutations()        replicas()          checkpoints()  │
//! │   cache_entries  mutation_log       local_replicas      sync_checkpoints│
//! │   (gateway read) (queue, replay)    (drafts, ids)       (since cursor) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! File databases run in WAL mode so a foreground read never waits on a
//! pass that is writing replicas. `:memory:` databases exist once per
//! connection, so their pool holds exactly one connection for its lifetime.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::cache::CacheRepository;
use crate::repository::checkpoint::CheckpointRepository;
use crate::repository::mutation_log::MutationLogRepository;
use crate::repository::replica::ReplicaRepository;

const MEMORY_PATH: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// How to open the local store.
///
/// ## Example
/// ```rust
/// use till_db::DbConfig;
///
/// let config = DbConfig::new("/var/lib/till/till.db")
///     .max_connections(8)
///     .min_connections(1);
/// assert_eq!(config.max_connections, 8);
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite file, or `:memory:`.
    pub database_path: PathBuf,

    /// Upper bound on pooled connections (5 unless set).
    pub max_connections: u32,

    /// Connections kept open while idle (1 unless set).
    pub min_connections: u32,

    /// How long a caller waits for a free connection.
    pub connect_timeout: Duration,

    /// How long SQLite retries a locked database before failing a statement.
    pub busy_timeout: Duration,

    /// Idle connections are closed after this; `None` keeps them.
    pub idle_timeout: Option<Duration>,

    /// Apply pending migrations when opening.
    pub run_migrations: bool,
}

impl DbConfig {
    /// File-backed store at `path`; the file is created on first open.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
            run_migrations: true,
        }
    }

    /// Private store for one test or one short-lived tool.
    pub fn in_memory() -> Self {
        DbConfig {
            max_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: None,
            ..DbConfig::new(MEMORY_PATH)
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == MEMORY_PATH
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let options = if self.is_in_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
        } else {
            SqliteConnectOptions::new()
                .filename(&self.database_path)
                .journal_mode(SqliteJournalMode::Wal)
                .create_if_missing(true)
        };

        Ok(options
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout)
            .foreign_keys(true))
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        let options = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.connect_timeout)
            .idle_timeout(self.idle_timeout);

        if self.is_in_memory() {
            // Recycling the only connection would drop every table.
            options.max_lifetime(None)
        } else {
            options
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Handle to the local store. Clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the store described by `config`, applying migrations unless
    /// disabled.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(path = %config.database_path.display(), "Opening local store");

        let pool = config
            .pool_options()
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        debug!(
            max_connections = config.max_connections,
            in_memory = config.is_in_memory(),
            "Pool ready"
        );

        let db = Database { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    /// Applies pending migrations. A no-op when the schema is current.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await?;
        let (total, applied) = migrations::migration_status(&self.pool).await?;
        info!(total, applied, "Schema up to date");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Read-through cache of server responses.
    pub fn cache(&self) -> CacheRepository {
        CacheRepository::new(self.pool.clone())
    }

    /// Queue of local operations awaiting replay.
    pub fn mutations(&self) -> MutationLogRepository {
        MutationLogRepository::new(self.pool.clone())
    }

    /// Local copies of server resources and unsent drafts.
    pub fn replicas(&self) -> ReplicaRepository {
        ReplicaRepository::new(self.pool.clone())
    }

    /// Per-store "changes since" cursors.
    pub fn checkpoints(&self) -> CheckpointRepository {
        CheckpointRepository::new(self.pool.clone())
    }

    /// Closes every pooled connection; later queries fail.
    pub async fn close(&self) {
        info!("Closing local store");
        self.pool.close().await;
    }

    /// True if a trivial query succeeds.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_opens_with_full_schema() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert_eq!((total, applied), (3, 3));
    }

    #[tokio::test]
    async fn reopening_the_schema_is_a_no_op() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.run_migrations().await.unwrap();
        assert!(db.health_check().await);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let stamp = chrono::Utc::now().timestamp_micros();
        let dir = std::env::temp_dir().join(format!("till-db-{}-{}", std::process::id(), stamp));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("till.db");

        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        db.checkpoints()
            .advance("s1", chrono::Utc::now())
            .await
            .unwrap();
        db.close().await;

        let reopened = Database::new(DbConfig::new(&path)).await.unwrap();
        assert!(reopened.checkpoints().get("s1").await.unwrap().is_some());
        reopened.close().await;

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = DbConfig::new("/tmp/till.db")
            .max_connections(10)
            .min_connections(2)
            .busy_timeout(Duration::from_secs(1))
            .run_migrations(false);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.busy_timeout, Duration::from_secs(1));
        assert!(!config.run_migrations);
        assert!(!config.is_in_memory());

        let memory = DbConfig::in_memory();
        assert!(memory.is_in_memory());
        assert_eq!(memory.max_connections, 1);
    }
}
