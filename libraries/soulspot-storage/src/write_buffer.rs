//! Coalescing write buffer
//!
//! Scans and download progress produce many small writes, often to the same
//! row. Issuing each as its own transaction means each one competes for the
//! SQLite write lock. A [`WriteBuffer`] keeps the latest pending value per key
//! and writes everything in a single transaction, either when a background
//! flusher wakes up or when a caller asks with [`WriteBuffer::flush`].
//!
//! Reads of pending values go through [`WriteBuffer::get`], so a caller sees
//! its own writes before they reach the database.

use crate::error::{Result, StorageError};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A record that can be buffered and written in batches
#[async_trait]
pub trait BufferedRecord: Clone + Send + Sync + 'static {
    /// Identity used to coalesce writes to the same row
    type Key: Eq + Hash + Clone + Debug + Send + Sync;

    fn key(&self) -> Self::Key;

    /// Fold a newer write for the same key into this pending one
    fn merge(&mut self, newer: Self) {
        *self = newer;
    }

    /// Write a batch on a connection that is already inside a transaction
    async fn write_batch(
        conn: &mut SqliteConnection,
        records: &[Self],
    ) -> std::result::Result<(), sqlx::Error>;
}

/// Flush thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBufferConfig {
    /// Pending record count that wakes the flusher early
    pub max_pending: usize,
    /// Interval of the background flusher
    pub flush_interval: Duration,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            max_pending: 500,
            flush_interval: Duration::from_secs(2),
        }
    }
}

/// Counters describing buffer activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteBufferStats {
    pub pushed: u64,
    /// Pushes folded into an already pending record
    pub coalesced: u64,
    pub flushed_records: u64,
    pub flush_batches: u64,
    pub failed_flushes: u64,
    pub pending: usize,
}

/// Pending records in first-write order
struct PendingSet<R: BufferedRecord> {
    records: Vec<R>,
    index: HashMap<R::Key, usize>,
}

impl<R: BufferedRecord> PendingSet<R> {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true when the record was merged into a pending one
    fn insert(&mut self, record: R) -> bool {
        let key = record.key();
        if let Some(&pos) = self.index.get(&key) {
            self.records[pos].merge(record);
            true
        } else {
            self.index.insert(key, self.records.len());
            self.records.push(record);
            false
        }
    }

    fn get(&self, key: &R::Key) -> Option<&R> {
        self.index.get(key).map(|&pos| &self.records[pos])
    }

    fn take(&mut self) -> Vec<R> {
        self.index.clear();
        std::mem::take(&mut self.records)
    }

    /// Put back records from a failed flush ahead of anything pushed since
    ///
    /// A record pushed during the flush is newer, so it is merged over the
    /// restored one rather than replaced by it.
    fn restore(&mut self, failed: Vec<R>) {
        let newer = self.take();
        let mut newer_by_key: HashMap<R::Key, R> =
            newer.iter().map(|r| (r.key(), r.clone())).collect();
        let restored_keys: HashSet<R::Key> = failed.iter().map(BufferedRecord::key).collect();

        for mut record in failed {
            if let Some(update) = newer_by_key.remove(&record.key()) {
                record.merge(update);
            }
            self.insert(record);
        }
        for record in newer {
            if !restored_keys.contains(&record.key()) {
                self.insert(record);
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    coalesced: AtomicU64,
    flushed_records: AtomicU64,
    flush_batches: AtomicU64,
    failed_flushes: AtomicU64,
}

struct Inner<R: BufferedRecord> {
    name: String,
    pool: SqlitePool,
    retry: RetryPolicy,
    config: WriteBufferConfig,
    pending: Mutex<PendingSet<R>>,
    /// Batch currently being written, still visible to `get`
    in_flight: Mutex<HashMap<R::Key, R>>,
    flush_lock: Mutex<()>,
    wake: Notify,
    counters: Counters,
}

/// Buffer of pending writes for one record type
pub struct WriteBuffer<R: BufferedRecord> {
    inner: Arc<Inner<R>>,
}

impl<R: BufferedRecord> Clone for WriteBuffer<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: BufferedRecord> WriteBuffer<R> {
    /// Create a buffer; `name` appears in log lines and retry errors
    pub fn new(
        name: impl Into<String>,
        pool: SqlitePool,
        retry: RetryPolicy,
        config: WriteBufferConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                pool,
                retry,
                config,
                pending: Mutex::new(PendingSet::new()),
                in_flight: Mutex::new(HashMap::new()),
                flush_lock: Mutex::new(()),
                wake: Notify::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &WriteBufferConfig {
        &self.inner.config
    }

    /// Queue a write, merging it into a pending write for the same key
    pub async fn push(&self, record: R) {
        let pending_len = {
            let mut pending = self.inner.pending.lock().await;
            if pending.insert(record) {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            }
            pending.len()
        };
        self.inner.counters.pushed.fetch_add(1, Ordering::Relaxed);

        if pending_len >= self.inner.config.max_pending {
            self.inner.wake.notify_one();
        }
    }

    /// Pending value for `key`, if it has not been flushed yet
    pub async fn get(&self, key: &R::Key) -> Option<R> {
        if let Some(record) = self.inner.pending.lock().await.get(key) {
            return Some(record.clone());
        }
        self.inner.in_flight.lock().await.get(key).cloned()
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Write every pending record in one transaction
    ///
    /// Returns the number of records written. On failure the records are put
    /// back into the buffer so the next flush retries them.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.inner.flush_lock.lock().await;

        // Both locks are held across the move so `get` always finds the record
        let batch = {
            let mut pending = self.inner.pending.lock().await;
            let batch = pending.take();
            if batch.is_empty() {
                return Ok(0);
            }
            *self.inner.in_flight.lock().await =
                batch.iter().map(|r| (r.key(), r.clone())).collect();
            batch
        };

        let operation = format!("write_buffer.{}", self.inner.name);
        let pool = &self.inner.pool;
        let records = batch.as_slice();

        let result = self
            .inner
            .retry
            .run(&operation, || async move {
                let mut tx = pool.begin().await?;
                R::write_batch(&mut *tx, records).await?;
                tx.commit().await?;
                Ok::<_, StorageError>(())
            })
            .await;

        match result {
            Ok(()) => {
                self.inner.in_flight.lock().await.clear();
                let count = batch.len();
                self.inner
                    .counters
                    .flushed_records
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.inner
                    .counters
                    .flush_batches
                    .fetch_add(1, Ordering::Relaxed);
                debug!(buffer = %self.inner.name, count, "Flushed write buffer");
                Ok(count)
            }
            Err(err) => {
                self.inner
                    .counters
                    .failed_flushes
                    .fetch_add(1, Ordering::Relaxed);
                let mut pending = self.inner.pending.lock().await;
                pending.restore(batch);
                self.inner.in_flight.lock().await.clear();
                Err(err)
            }
        }
    }

    /// Flush on an interval, or early when the buffer fills up
    ///
    /// The task performs a last flush after `shutdown` is cancelled.
    pub fn spawn_flusher(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let buffer = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(buffer.inner.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = buffer.inner.wake.notified() => {}
                }

                if let Err(e) = buffer.flush().await {
                    error!(buffer = %buffer.inner.name, error = %e, "Write buffer flush failed");
                }
            }

            match buffer.flush().await {
                Ok(count) => {
                    info!(buffer = %buffer.inner.name, count, "Write buffer flusher stopped")
                }
                Err(e) => error!(
                    buffer = %buffer.inner.name,
                    error = %e,
                    "Final write buffer flush failed"
                ),
            }
        })
    }

    pub async fn stats(&self) -> WriteBufferStats {
        let pending = self.pending_len().await;
        let c = &self.inner.counters;
        WriteBufferStats {
            pushed: c.pushed.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            flushed_records: c.flushed_records.load(Ordering::Relaxed),
            flush_batches: c.flush_batches.load(Ordering::Relaxed),
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
            pending,
        }
    }
}
