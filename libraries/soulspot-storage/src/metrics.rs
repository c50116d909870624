//! Lock contention counters
//!
//! Every [`RetryPolicy`](crate::retry::RetryPolicy) reports into a
//! [`LockMetrics`]. By default that is the process-wide instance returned by
//! [`LockMetrics::global`], so one snapshot describes how much the whole
//! process is fighting over the SQLite write lock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static GLOBAL: OnceLock<Arc<LockMetrics>> = OnceLock::new();

/// Atomic counters describing "database is locked" handling
#[derive(Debug, Default)]
pub struct LockMetrics {
    lock_errors: AtomicU64,
    retries: AtomicU64,
    recovered: AtomicU64,
    exhausted: AtomicU64,
    total_wait_ms: AtomicU64,
}

/// Point-in-time copy of [`LockMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetricsSnapshot {
    /// Lock errors observed, including the final one of an exhausted operation
    pub lock_errors: u64,
    /// Sleeps scheduled before another attempt
    pub retries: u64,
    /// Operations that succeeded after at least one retry
    pub recovered: u64,
    /// Operations that gave up
    pub exhausted: u64,
    /// Total backoff time
    pub total_wait_ms: u64,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance
    pub fn global() -> Arc<LockMetrics> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(LockMetrics::new())))
    }

    pub fn record_lock_error(&self) {
        self.lock_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, delay: Duration) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_recovered(&self) {
        self.recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            lock_errors: self.lock_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.lock_errors.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.recovered.store(0, Ordering::Relaxed);
        self.exhausted.store(0, Ordering::Relaxed);
        self.total_wait_ms.store(0, Ordering::Relaxed);
    }
}
