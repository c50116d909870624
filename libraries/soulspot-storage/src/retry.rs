//! Retry with exponential backoff for SQLite lock contention
//!
//! SQLite allows a single writer. Even in WAL mode with a busy timeout, a
//! long write (bulk sync, scan flush) can make other writers fail with
//! `SQLITE_BUSY` / "database is locked". [`RetryPolicy::run`] re-runs the
//! whole operation after a jittered exponential delay when that happens and
//! gives up with [`StorageError::LockTimeout`] once the attempts are spent.
//!
//! Only lock contention is retried. Constraint violations, syntax errors and
//! everything else are returned on the first attempt.
//!
//! # Example
//!
//! ```rust,no_run
//! use soulspot_storage::retry::{RetryConfig, RetryPolicy};
//! # async fn example(pool: &sqlx::SqlitePool) -> soulspot_storage::Result<()> {
//! let policy = RetryPolicy::new(RetryConfig::default());
//!
//! policy
//!     .run("settings.touch", || async move {
//!         sqlx::query("UPDATE jobs SET priority = priority WHERE 0")
//!             .execute(pool)
//!             .await?;
//!         Ok::<_, soulspot_storage::StorageError>(())
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, StorageError};
use crate::metrics::LockMetrics;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// SQLITE_BUSY primary result code
const SQLITE_BUSY: i64 = 5;
/// SQLITE_LOCKED primary result code
const SQLITE_LOCKED: i64 = 6;

const LOCK_MESSAGES: &[&str] = &[
    "database is locked",
    "database table is locked",
    "database schema is locked",
];

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Random spread as a fraction of the delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Config that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Un-jittered delay after the `attempt`-th failure (1-based)
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let raw = self.base_delay.as_secs_f64() * factor;
        let capped = if raw.is_finite() {
            raw.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        };
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// [`delay_for`](Self::delay_for) spread by `±jitter`, clamped to `[0, max_delay]`
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }

        let spread: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let secs = delay.as_secs_f64() * (1.0 + jitter * spread);
        Duration::from_secs_f64(secs.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// Whether a SQLx error is transient lock contention
///
/// Matches SQLite `SQLITE_BUSY`/`SQLITE_LOCKED` (including extended codes
/// such as `SQLITE_BUSY_SNAPSHOT`), the corresponding messages, and pool
/// acquisition timeouts caused by connections held by a long writer.
pub fn is_lock_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code_matches = db_err
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .is_some_and(is_lock_code);
            code_matches || is_lock_message(db_err.message())
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Whether an SQLite (extended) result code means busy/locked
pub fn is_lock_code(code: i64) -> bool {
    let primary = code & 0xff;
    primary == SQLITE_BUSY || primary == SQLITE_LOCKED
}

/// Whether an error message describes a locked database
pub fn is_lock_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    LOCK_MESSAGES.iter().any(|needle| message.contains(needle))
}

/// Runs database operations, retrying on lock contention
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    metrics: Arc<LockMetrics>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Policy reporting into the global [`LockMetrics`]
    pub fn new(config: RetryConfig) -> Self {
        Self::with_metrics(config, LockMetrics::global())
    }

    pub fn with_metrics(config: RetryConfig, metrics: Arc<LockMetrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<LockMetrics> {
        &self.metrics
    }

    /// Run `op`, re-running it while it fails with a lock error
    ///
    /// `op` is called once per attempt, so it must rebuild any transaction it
    /// uses. `operation` names the call site in logs and in the final error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.metrics.record_recovered();
                        debug!(operation, attempt, "Database lock cleared");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_lock_error() => {
                    self.metrics.record_lock_error();

                    if attempt >= max_attempts {
                        self.metrics.record_exhausted();
                        warn!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "Database still locked, giving up"
                        );
                        return Err(StorageError::LockTimeout {
                            operation: operation.to_string(),
                            attempts: attempt,
                        });
                    }

                    let delay = self.config.jittered_delay(attempt);
                    self.metrics.record_retry(delay);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Database locked, retrying"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
