//! One-shot CLI commands
//!
//! These work directly on the databases without starting workers. A job
//! enqueued here is persisted as pending and runs when the daemon next
//! starts (or immediately, if `enqueue_scan` is called on a running
//! [`Daemon`](crate::daemon::Daemon)).

use crate::error::{DaemonError, Result};
use serde::Serialize;
use soulspot_core::{Job, JobId, JobPriority, JobStatus, JobType};
use soulspot_jobs::handlers::LibraryScanPayload;
use soulspot_storage::jobs::{self, JobCounts};
use soulspot_storage::logs::{LogQuery, LogRecord, LogStore};
use soulspot_storage::{tracks, Database, LockMetrics, LockMetricsSnapshot};
use std::path::Path;

/// Persist a pending library scan of `path`
pub async fn enqueue_scan(
    db: &Database,
    path: &Path,
    priority: JobPriority,
    max_attempts: u32,
) -> Result<Job> {
    if !path.is_dir() {
        return Err(DaemonError::InvalidInput(format!(
            "not a directory: {}",
            path.display()
        )));
    }
    let path = path.canonicalize()?;
    let payload = serde_json::to_value(LibraryScanPayload { path })
        .map_err(|e| DaemonError::InvalidInput(e.to_string()))?;

    let job = Job::new(JobType::LibraryScan, payload)
        .with_priority(priority)
        .with_max_attempts(max_attempts);
    jobs::insert(db, &job).await?;
    Ok(job)
}

/// Jobs newest first, optionally filtered by status
pub async fn list_jobs(db: &Database, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
    Ok(jobs::list(db, status, limit.max(1)).await?)
}

/// Cancel a pending job
///
/// Running jobs belong to a live daemon, whose worker would not notice a
/// change made here, so they are rejected.
pub async fn cancel_job(db: &Database, id: &str) -> Result<()> {
    let id = JobId::new(id);
    let Some(job) = jobs::get(db, &id).await? else {
        return Err(DaemonError::InvalidInput(format!("no job with id {id}")));
    };
    if job.status != JobStatus::Pending {
        return Err(DaemonError::InvalidInput(format!(
            "job {id} is {}, only pending jobs can be cancelled",
            job.status
        )));
    }
    if !jobs::mark_cancelled(db, &id).await? {
        return Err(DaemonError::InvalidInput(format!(
            "job {id} finished before it could be cancelled"
        )));
    }
    Ok(())
}

pub async fn query_logs(store: &LogStore, query: &LogQuery) -> Result<Vec<LogRecord>> {
    Ok(store.query(query).await?)
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub jobs: JobCounts,
    pub tracks: i64,
    pub log_records: i64,
    /// Lock contention seen by this process only
    pub lock_metrics: LockMetricsSnapshot,
}

pub async fn stats(db: &Database, logs: &LogStore) -> Result<StoreStats> {
    Ok(StoreStats {
        jobs: jobs::counts_by_status(db).await?,
        tracks: tracks::count(db).await?,
        log_records: logs.count().await?,
        lock_metrics: LockMetrics::global().snapshot(),
    })
}

pub fn format_job(job: &Job) -> String {
    let priority = format!("{:?}", job.priority).to_lowercase();
    let mut line = format!(
        "{}  {:<13} {:<9} {:<7} attempts {}/{}  created {}",
        job.id,
        job.job_type.as_str(),
        job.status.as_str(),
        priority,
        job.attempts,
        job.max_attempts,
        job.created_at.format("%Y-%m-%d %H:%M:%S"),
    );
    if let Some(error) = &job.last_error {
        line.push_str("  error: ");
        line.push_str(error);
    }
    line
}

pub fn format_log(record: &LogRecord) -> String {
    let mut line = format!(
        "{} {:<5} {}: {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level.as_str().to_uppercase(),
        record.target,
        record.message,
    );
    if let Some(fields) = &record.fields {
        line.push(' ');
        line.push_str(&fields.to_string());
    }
    line
}
