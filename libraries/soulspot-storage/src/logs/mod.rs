//! Logs database
//!
//! Application logs are stored in their own SQLite file with its own pool.
//! A log burst therefore never holds the write lock of the library database,
//! and the library database never waits on log inserts.
//!
//! Records arrive through [`DbLogLayer`], a `tracing` layer that hands them
//! to a [`LogWriter`] task over a bounded channel. The writer inserts them in
//! batches.
//!
//! # Example
//!
//! ```rust,no_run
//! use soulspot_storage::logs::{log_channel, LogStore, LogWriter, LogWriterConfig};
//! use soulspot_storage::{PoolSettings, RetryConfig};
//! use tokio_util::sync::CancellationToken;
//! use tracing_subscriber::prelude::*;
//!
//! # async fn example() -> soulspot_storage::Result<()> {
//! let settings = PoolSettings::default();
//! let url = "sqlite://soulspot-logs.db";
//! let store = LogStore::open(url, &settings, RetryConfig::default()).await?;
//! let (layer, receiver) = log_channel(10_000);
//!
//! tracing_subscriber::registry().with(layer).init();
//!
//! let shutdown = CancellationToken::new();
//! let writer = LogWriter::new(store, receiver, LogWriterConfig::default()).spawn(shutdown.clone());
//!
//! // ...
//! shutdown.cancel();
//! writer.await.ok();
//! # Ok(())
//! # }
//! ```

mod layer;

pub use layer::{log_channel, DbLogLayer, LogWriter, LogWriterConfig};

use crate::retry::{RetryConfig, RetryPolicy};
use crate::{create_pool_with, from_millis, now_millis, run_log_migrations, PoolSettings};
use crate::{Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Severity stored with each record, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn value(self) -> i64 {
        self as i64
    }

    /// Out-of-range values clamp to the nearest level
    pub fn from_value(value: i64) -> Self {
        match value {
            i64::MIN..=0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(StorageError::Query(format!("Unknown log level: {}", other))),
        }
    }
}

/// One stored log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    /// Structured event fields other than the message
    pub fields: Option<serde_json::Value>,
}

impl LogRecord {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            target: target.into(),
            message: message.into(),
            fields: None,
        }
    }
}

/// Filter for [`LogStore::query`]
#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    /// Only records at this level or more severe
    pub min_level: Option<LogLevel>,
    pub target_prefix: Option<String>,
    /// Case-insensitive substring of the message
    pub contains: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            min_level: None,
            target_prefix: None,
            contains: None,
            since: None,
            limit: 100,
        }
    }
}

#[derive(FromRow)]
struct LogRow {
    timestamp: i64,
    level: i64,
    target: String,
    message: String,
    fields: Option<String>,
}

impl From<LogRow> for LogRecord {
    fn from(row: LogRow) -> Self {
        LogRecord {
            timestamp: from_millis(row.timestamp),
            level: LogLevel::from_value(row.level),
            target: row.target,
            message: row.message,
            // A corrupt fields column should not hide the log line itself
            fields: row
                .fields
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok()),
        }
    }
}

/// Handle to the logs database
#[derive(Debug, Clone)]
pub struct LogStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl LogStore {
    /// Open (creating if needed) and migrate the logs database
    ///
    /// `retry` governs lock retries for writes and retention deletes.
    pub async fn open(
        database_url: &str,
        settings: &PoolSettings,
        retry: RetryConfig,
    ) -> Result<Self> {
        let pool = create_pool_with(database_url, settings).await?;
        run_log_migrations(&pool).await?;
        Ok(Self::from_pool(pool, RetryPolicy::new(retry)))
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Wrap an existing, already migrated pool
    pub fn from_pool(pool: SqlitePool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert records in a single transaction
    pub async fn insert_batch(&self, records: &[LogRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let encoded = records
            .iter()
            .map(|r| r.fields.as_ref().map(serde_json::to_string).transpose())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let pool = &self.pool;
        let encoded = encoded.as_slice();

        self.retry
            .run("logs.insert_batch", || async move {
                let mut tx = pool.begin().await?;
                for (record, fields) in records.iter().zip(encoded) {
                    sqlx::query(
                        "INSERT INTO logs (timestamp, level, target, message, fields) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(record.timestamp.timestamp_millis())
                    .bind(record.level.value())
                    .bind(&record.target)
                    .bind(&record.message)
                    .bind(fields)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok::<_, StorageError>(())
            })
            .await?;

        Ok(records.len())
    }

    /// Matching records, newest first
    pub async fn query(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT timestamp, level, target, message, fields FROM logs WHERE 1 = 1",
        );

        if let Some(level) = query.min_level {
            builder.push(" AND level >= ").push_bind(level.value());
        }
        if let Some(prefix) = &query.target_prefix {
            builder
                .push(" AND substr(target, 1, ")
                .push_bind(prefix.chars().count() as i64)
                .push(") = ")
                .push_bind(prefix.clone());
        }
        if let Some(needle) = &query.contains {
            builder
                .push(" AND instr(lower(message), lower(")
                .push_bind(needle.clone())
                .push(")) > 0");
        }
        if let Some(since) = query.since {
            builder
                .push(" AND timestamp >= ")
                .push_bind(since.timestamp_millis());
        }

        builder
            .push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(query.limit.max(0));

        let rows: Vec<LogRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LogRecord::from).collect())
    }

    /// Delete records older than `age`; returns the number removed
    pub async fn prune_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = now_millis() - i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        let pool = &self.pool;

        self.retry
            .run("logs.prune", || async move {
                let result = sqlx::query("DELETE FROM logs WHERE timestamp < ?")
                    .bind(cutoff)
                    .execute(pool)
                    .await?;
                Ok::<_, StorageError>(result.rows_affected())
            })
            .await
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
