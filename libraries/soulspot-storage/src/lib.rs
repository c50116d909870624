//! SoulSpot Storage
//!
//! `SQLite` persistence for SoulSpot, built around SQLite's single-writer
//! limitation.
//!
//! # Architecture
//!
//! - **WAL + busy timeout**: every pool runs in WAL mode so readers never
//!   block the writer
//! - **Retry with backoff**: writes go through a [`RetryPolicy`] that re-runs
//!   them when the database is locked, reporting into [`LockMetrics`]
//! - **Write buffering**: high-churn writes (scan results, download progress)
//!   are coalesced in a [`WriteBuffer`] and flushed in one transaction
//! - **Separate logs database**: log records go to their own file through
//!   [`logs::LogStore`] so logging never competes for the library write lock
//! - **Vertical slices**: `jobs`, `downloads` and `tracks` own their queries
//!
//! # Example
//!
//! ```rust,no_run
//! use soulspot_storage::{Database, PoolSettings, RetryConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::connect(
//!     "sqlite://soulspot.db",
//!     &PoolSettings::default(),
//!     RetryConfig::default(),
//! )
//! .await?;
//!
//! let pending = soulspot_storage::jobs::counts_by_status(&db).await?;
//! # Ok(())
//! # }
//! ```

mod error;

pub mod metrics;
pub mod retry;
pub mod write_buffer;

// Vertical slices
pub mod downloads;
pub mod jobs;
pub mod tracks;

// Logs database
pub mod logs;

pub use error::{Result, StorageError};
pub use metrics::{LockMetrics, LockMetricsSnapshot};
pub use retry::{RetryConfig, RetryPolicy};
pub use write_buffer::{BufferedRecord, WriteBuffer, WriteBufferConfig, WriteBufferStats};

use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

// Embed migrations into binary
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
static LOG_MIGRATOR: Migrator = sqlx::migrate!("./log_migrations");

/// Connection pool settings shared by the library and logs databases
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    /// How long SQLite itself waits on a lock before reporting `SQLITE_BUSY`
    pub busy_timeout: Duration,
    /// How long to wait for a free pooled connection
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Run library database migrations
///
/// This should be called once when the application starts to ensure
/// the database schema is up to date.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Run logs database migrations
pub async fn run_log_migrations(pool: &SqlitePool) -> Result<()> {
    LOG_MIGRATOR.run(pool).await?;
    Ok(())
}

/// Create a new `SQLite` pool with default settings
///
/// # Arguments
///
/// * `database_url` - `SQLite` connection string (e.g., `<sqlite://soulspot.db>`)
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    create_pool_with(database_url, &PoolSettings::default()).await
}

/// Create a new `SQLite` pool in WAL mode
pub async fn create_pool_with(database_url: &str, settings: &PoolSettings) -> Result<SqlitePool> {
    debug!(url = database_url, "Creating SQLite pool");

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(settings.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(options)
        .await
        .map_err(|e| StorageError::Connection(format!("{}: {}", database_url, e)))?;

    Ok(pool)
}

/// Library database handle: a pool plus the retry policy for its writes
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl Database {
    /// Open (creating if needed) and migrate the library database
    pub async fn connect(
        database_url: &str,
        settings: &PoolSettings,
        retry: RetryConfig,
    ) -> Result<Self> {
        let pool = create_pool_with(database_url, settings).await?;
        run_migrations(&pool).await?;
        info!(url = database_url, "Library database ready");

        Ok(Self::from_pool(pool, RetryPolicy::new(retry)))
    }

    /// Wrap an existing, already migrated pool
    pub fn from_pool(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Current time as unix milliseconds, the timestamp format of every table
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(value: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(value).unwrap_or_default()
}
