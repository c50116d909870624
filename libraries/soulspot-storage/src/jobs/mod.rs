//! Persisted background jobs
//!
//! The in-memory queue lives in `soulspot-jobs`; this table is what survives
//! a restart. [`recoverable`] returns everything that still has to run,
//! resetting jobs that were `running` when the process died.
//!
//! # Example
//!
//! ```rust,no_run
//! use soulspot_core::{Job, JobType};
//! use soulspot_storage::{jobs, Database};
//!
//! # async fn example(db: &Database) -> soulspot_storage::Result<()> {
//! let job = Job::new(JobType::LibraryScan, serde_json::json!({ "path": "/music" }));
//! jobs::insert(db, &job).await?;
//!
//! jobs::mark_running(db, &job.id).await?;
//! jobs::mark_completed(db, &job.id, None).await?;
//! # Ok(())
//! # }
//! ```

use crate::{from_millis, now_millis, Database, Result, StorageError};
use serde::Serialize;
use soulspot_core::{Job, JobId, JobPriority, JobStatus};
use sqlx::FromRow;
use std::time::Duration;

#[derive(FromRow)]
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    priority: i64,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    last_error: Option<String>,
    result: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = StorageError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: JobId::new(row.id),
            job_type: row.job_type.parse()?,
            status: row.status.parse()?,
            priority: JobPriority::from_value(row.priority),
            payload: serde_json::from_str(&row.payload)?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or(1),
            last_error: row.last_error,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            created_at: from_millis(row.created_at),
            started_at: row.started_at.map(from_millis),
            completed_at: row.completed_at.map(from_millis),
        })
    }
}

/// Job totals per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl JobCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }
}

const SELECT_JOB: &str = r#"
    SELECT id, job_type, status, priority, payload, attempts, max_attempts,
           last_error, result, created_at, started_at, completed_at
    FROM jobs
"#;

/// Persist a new job
pub async fn insert(db: &Database, job: &Job) -> Result<()> {
    let pool = db.pool();
    let payload = serde_json::to_string(&job.payload)?;
    let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
    let (payload, result) = (payload.as_str(), result.as_deref());

    db.retry()
        .run("jobs.insert", || async move {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, status, priority, payload, attempts, max_attempts,
                    last_error, result, created_at, started_at, completed_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(job.job_type.as_str())
            .bind(job.status.as_str())
            .bind(job.priority.value())
            .bind(payload)
            .bind(i64::from(job.attempts))
            .bind(i64::from(job.max_attempts))
            .bind(&job.last_error)
            .bind(result)
            .bind(job.created_at.timestamp_millis())
            .bind(job.started_at.map(|t| t.timestamp_millis()))
            .bind(job.completed_at.map(|t| t.timestamp_millis()))
            .execute(pool)
            .await?;
            Ok::<_, StorageError>(())
        })
        .await
}

/// Get a job by ID
pub async fn get(db: &Database, id: &JobId) -> Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_JOB))
        .bind(id)
        .fetch_optional(db.pool())
        .await?;

    row.map(Job::try_from).transpose()
}

/// Jobs newest first, optionally filtered by status
pub async fn list(db: &Database, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
    let rows: Vec<JobRow> = match status {
        Some(status) => {
            sqlx::query_as(&format!(
                "{} WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                SELECT_JOB
            ))
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(db.pool())
            .await?
        }
        None => {
            sqlx::query_as(&format!("{} ORDER BY created_at DESC LIMIT ?", SELECT_JOB))
                .bind(limit)
                .fetch_all(db.pool())
                .await?
        }
    };

    rows.into_iter().map(Job::try_from).collect()
}

/// Run a guarded UPDATE through the retry policy
///
/// `sql` binds `?1` to `text`, `?2` to the current time and `?3` to the id.
/// Returns false when the job exists but its status did not match the guard,
/// and NotFound when there is no such job.
async fn update_job(
    db: &Database,
    operation: &str,
    id: &JobId,
    sql: &str,
    text: Option<&str>,
) -> Result<bool> {
    let pool = db.pool();
    let now = now_millis();

    let affected = db
        .retry()
        .run(operation, || async move {
            let result = sqlx::query(sql)
                .bind(text)
                .bind(now)
                .bind(id)
                .execute(pool)
                .await?;
            Ok::<_, StorageError>(result.rows_affected())
        })
        .await?;

    if affected > 0 {
        return Ok(true);
    }
    match get(db, id).await? {
        Some(_) => Ok(false),
        None => Err(StorageError::not_found("job", id.as_str())),
    }
}

/// Claim a pending job for a worker, counting the attempt
///
/// Returns false when the job exists but is no longer pending, e.g. it was
/// cancelled after being queued.
pub async fn mark_running(db: &Database, id: &JobId) -> Result<bool> {
    let pool = db.pool();
    let now = now_millis();

    let affected = db
        .retry()
        .run("jobs.mark_running", || async move {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'running', attempts = attempts + 1,
                    started_at = ?, completed_at = NULL
                WHERE id = ? AND status = 'pending'
                "#,
            )
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
            Ok::<_, StorageError>(result.rows_affected())
        })
        .await?;

    if affected > 0 {
        return Ok(true);
    }
    match get(db, id).await? {
        Some(_) => Ok(false),
        None => Err(StorageError::not_found("job", id.as_str())),
    }
}

/// Finish a running job successfully, storing its result
///
/// Returns false when the job left `running` in the meantime, e.g. it was
/// cancelled while the handler ran.
pub async fn mark_completed(
    db: &Database,
    id: &JobId,
    result: Option<&serde_json::Value>,
) -> Result<bool> {
    let result = result.map(serde_json::to_string).transpose()?;

    update_job(
        db,
        "jobs.mark_completed",
        id,
        r#"
        UPDATE jobs
        SET status = 'completed', result = ?1, last_error = NULL, completed_at = ?2
        WHERE id = ?3 AND status = 'running'
        "#,
        result.as_deref(),
    )
    .await
}

/// Finish an unfinished job as failed for good
///
/// Pending jobs are accepted too, for jobs that never reached a worker.
/// Returns false when the job is already terminal.
pub async fn mark_failed(db: &Database, id: &JobId, error: &str) -> Result<bool> {
    update_job(
        db,
        "jobs.mark_failed",
        id,
        r#"
        UPDATE jobs
        SET status = 'failed', last_error = ?1, completed_at = ?2
        WHERE id = ?3 AND status IN ('pending', 'running')
        "#,
        Some(error),
    )
    .await
}

/// Put a running attempt back to `pending` for a retry or a later start
///
/// Returns false when the job is no longer running.
pub async fn mark_pending(db: &Database, id: &JobId, error: &str) -> Result<bool> {
    update_job(
        db,
        "jobs.mark_pending",
        id,
        r#"
        UPDATE jobs
        SET status = 'pending', last_error = ?1, started_at = NULL, completed_at = NULL
        WHERE id = ?3 AND status = 'running'
        "#,
        Some(error),
    )
    .await
}

/// Cancel a job that has not finished
///
/// Returns false when the job exists but is already terminal.
pub async fn mark_cancelled(db: &Database, id: &JobId) -> Result<bool> {
    let pool = db.pool();
    let now = now_millis();

    let affected = db
        .retry()
        .run("jobs.mark_cancelled", || async move {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'cancelled', completed_at = ?
                WHERE id = ? AND status IN ('pending', 'running')
                "#,
            )
            .bind(now)
            .bind(id)
            .execute(pool)
            .await?;
            Ok::<_, StorageError>(result.rows_affected())
        })
        .await?;

    if affected > 0 {
        return Ok(true);
    }
    match get(db, id).await? {
        Some(_) => Ok(false),
        None => Err(StorageError::not_found("job", id.as_str())),
    }
}

/// Jobs that still need to run after a restart
///
/// Jobs left `running` by a crashed process are reset to `pending` first.
/// The result is ordered by priority, then age.
pub async fn recoverable(db: &Database) -> Result<Vec<Job>> {
    let pool = db.pool();

    let reset = db
        .retry()
        .run("jobs.recover", || async move {
            let result = sqlx::query(
                "UPDATE jobs SET status = 'pending', started_at = NULL WHERE status = 'running'",
            )
            .execute(pool)
            .await?;
            Ok::<_, StorageError>(result.rows_affected())
        })
        .await?;

    if reset > 0 {
        tracing::warn!(count = reset, "Reset interrupted jobs to pending");
    }

    let rows: Vec<JobRow> = sqlx::query_as(&format!(
        "{} WHERE status = 'pending' ORDER BY priority DESC, created_at ASC",
        SELECT_JOB
    ))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Job::try_from).collect()
}

/// Number of jobs in each status
pub async fn counts_by_status(db: &Database) -> Result<JobCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .fetch_all(db.pool())
            .await?;

    let mut counts = JobCounts::default();
    for (status, count) in rows {
        match status.parse::<JobStatus>()? {
            JobStatus::Pending => counts.pending = count,
            JobStatus::Running => counts.running = count,
            JobStatus::Completed => counts.completed = count,
            JobStatus::Failed => counts.failed = count,
            JobStatus::Cancelled => counts.cancelled = count,
        }
    }

    Ok(counts)
}

/// Delete terminal jobs that finished more than `older_than` ago
pub async fn purge_finished(db: &Database, older_than: Duration) -> Result<u64> {
    let pool = db.pool();
    let cutoff = now_millis() - i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);

    db.retry()
        .run("jobs.purge_finished", || async move {
            let result = sqlx::query(
                r#"
                DELETE FROM jobs
                WHERE status IN ('completed', 'failed', 'cancelled')
                  AND COALESCE(completed_at, created_at) < ?
                "#,
            )
            .bind(cutoff)
            .execute(pool)
            .await?;
            Ok::<_, StorageError>(result.rows_affected())
        })
        .await
}
