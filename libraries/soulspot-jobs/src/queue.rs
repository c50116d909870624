//! Bounded in-memory priority queue feeding the workers
//!
//! The queue only holds jobs that are already persisted; losing it (crash,
//! restart) loses nothing because [`WorkerPool::start`](crate::WorkerPool::start)
//! rebuilds it from the `jobs` table.

use soulspot_core::{Job, JobId, JobPriority};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Job queue is full ({0} jobs)")]
    Full(usize),

    #[error("Job queue is closed")]
    Closed,

    #[error("Job {0} is already queued")]
    Duplicate(JobId),
}

struct QueuedJob {
    priority: JobPriority,
    seq: u64,
    job: Job,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    ids: HashSet<JobId>,
    next_seq: u64,
    closed: bool,
}

/// Async priority queue of jobs
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue a job behind everything of the same or higher priority
    pub async fn push(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.ids.contains(&job.id) {
                return Err(QueueError::Duplicate(job.id));
            }
            if state.heap.len() >= self.capacity {
                return Err(QueueError::Full(self.capacity));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.ids.insert(job.id.clone());
            state.heap.push(QueuedJob {
                priority: job.priority,
                seq,
                job,
            });
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next job
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Job> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.heap.pop() {
                    state.ids.remove(&entry.job.id);
                    // Pass the wakeup on if more work is waiting
                    if !state.heap.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(entry.job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take a job out of the queue before a worker gets it
    pub async fn remove(&self, id: &JobId) -> Option<Job> {
        let mut state = self.state.lock().await;
        if !state.ids.remove(id) {
            return None;
        }

        let mut removed = None;
        let heap = std::mem::take(&mut state.heap);
        state.heap = heap
            .into_iter()
            .filter_map(|entry| {
                if &entry.job.id == id {
                    removed = Some(entry.job);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        removed
    }

    /// Reject further pushes and wake every waiting `pop`
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued job ids in the order `pop` would return them
    pub async fn snapshot(&self) -> Vec<JobId> {
        let state = self.state.lock().await;
        let mut entries: Vec<&QueuedJob> = state.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.job.id.clone()).collect()
    }
}
