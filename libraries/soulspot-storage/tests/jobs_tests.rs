//! Integration tests for jobs vertical slice
//!
//! Tests job persistence including:
//! - Status transitions and attempt counting
//! - Crash recovery of running jobs
//! - Status counts and purging of finished jobs


use soulspot_core::{Job, JobId, JobPriority, JobStatus, JobType};
use soulspot_storage::{jobs, StorageError};
use std::time::Duration;
use test_helpers::*;

#[tokio::test]
async fn test_insert_and_get_job() {
    let test_db = TestDb::new().await;
    let job = Job::new(
        JobType::MetadataSync,
        serde_json::json!({ "provider": "spotify", "artist_id": "abc" }),
    )
    .with_priority(JobPriority::High)
    .with_max_attempts(5);
    jobs::insert(test_db.db(), &job).await.unwrap();

    let stored = jobs::get(test_db.db(), &job.id).await.unwrap().unwrap();
    assert_eq!(stored.job_type, JobType::MetadataSync);
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.priority, JobPriority::High);
    assert_eq!(stored.payload, job.payload);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.max_attempts, 5);
    assert!(stored.started_at.is_none());

    assert!(jobs::get(test_db.db(), &JobId::new("missing"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_lifecycle_transitions() {
    let test_db = TestDb::new().await;
    let job = create_test_job(test_db.db(), JobType::Download).await;

    assert!(jobs::mark_running(test_db.db(), &job.id).await.unwrap());
    let running = jobs::get(test_db.db(), &job.id).await.unwrap().unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.attempts, 1);
    assert!(running.started_at.is_some());

    assert!(jobs::mark_pending(test_db.db(), &job.id, "peer offline")
        .await
        .unwrap());
    let retrying = jobs::get(test_db.db(), &job.id).await.unwrap().unwrap();
    assert_eq!(retrying.status, JobStatus::Pending);
    assert_eq!(retrying.last_error.as_deref(), Some("peer offline"));

    jobs::mark_running(test_db.db(), &job.id).await.unwrap();
    jobs::mark_completed(
        test_db.db(),
        &job.id,
        Some(&serde_json::json!({ "bytes": 1024 })),
    )
    .await
    .unwrap();

    let done = jobs::get(test_db.db(), &job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempts, 2);
    assert_eq!(done.result, Some(serde_json::json!({ "bytes": 1024 })));
    assert!(done.last_error.is_none());
    assert!(done.completed_at.is_some());
}

#[tokio::test]
async fn test_mark_failed_records_error() {
    let test_db = TestDb::new().await;
    let job = create_test_job(test_db.db(), JobType::LibraryScan).await;

    jobs::mark_running(test_db.db(), &job.id).await.unwrap();
    jobs::mark_failed(test_db.db(), &job.id, "path not found")
        .await
        .unwrap();

    let failed = jobs::get(test_db.db(), &job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("path not found"));
}

#[tokio::test]
async fn test_transition_of_unknown_job_is_not_found() {
    let test_db = TestDb::new().await;

    let err = jobs::mark_running(test_db.db(), &JobId::new("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn test_cancel_only_unfinished_jobs() {
    let test_db = TestDb::new().await;
    let pending = create_test_job(test_db.db(), JobType::Download).await;
    let finished = create_test_job(test_db.db(), JobType::Download).await;
    jobs::mark_running(test_db.db(), &finished.id).await.unwrap();
    jobs::mark_completed(test_db.db(), &finished.id, None)
        .await
        .unwrap();

    assert!(jobs::mark_cancelled(test_db.db(), &pending.id).await.unwrap());
    assert!(!jobs::mark_cancelled(test_db.db(), &finished.id).await.unwrap());
    assert!(matches!(
        jobs::mark_cancelled(test_db.db(), &JobId::new("missing")).await,
        Err(StorageError::NotFound { .. })
    ));

    let cancelled = jobs::get(test_db.db(), &pending.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // A worker that popped the job before the cancel must not revive it
    assert!(!jobs::mark_running(test_db.db(), &pending.id).await.unwrap());
    let still = jobs::get(test_db.db(), &pending.id).await.unwrap().unwrap();
    assert_eq!(still.status, JobStatus::Cancelled);
    assert_eq!(still.attempts, 0);
}

#[tokio::test]
async fn test_cancelled_running_job_is_not_overwritten() {
    let test_db = TestDb::new().await;
    let job = create_test_job(test_db.db(), JobType::Download).await;
    jobs::mark_running(test_db.db(), &job.id).await.unwrap();

    assert!(jobs::mark_cancelled(test_db.db(), &job.id).await.unwrap());

    // The worker finishing afterwards is superseded
    let result = serde_json::json!({ "bytes": 1 });
    assert!(!jobs::mark_completed(test_db.db(), &job.id, Some(&result))
        .await
        .unwrap());
    assert!(!jobs::mark_pending(test_db.db(), &job.id, "retry")
        .await
        .unwrap());
    assert!(!jobs::mark_failed(test_db.db(), &job.id, "boom")
        .await
        .unwrap());

    let stored = jobs::get(test_db.db(), &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.result.is_none());
    assert!(stored.last_error.is_none());

    assert!(matches!(
        jobs::mark_completed(test_db.db(), &JobId::new("missing"), None).await,
        Err(StorageError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_only_running_jobs_complete_or_requeue() {
    let test_db = TestDb::new().await;
    let job = create_test_job(test_db.db(), JobType::LibraryScan).await;

    assert!(!jobs::mark_completed(test_db.db(), &job.id, None).await.unwrap());
    assert!(!jobs::mark_pending(test_db.db(), &job.id, "retry").await.unwrap());
    let stored = jobs::get(test_db.db(), &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.last_error.is_none());

    // A job that never reached a worker can still fail
    assert!(jobs::mark_failed(test_db.db(), &job.id, "queue full")
        .await
        .unwrap());
    let stored = jobs::get(test_db.db(), &job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_recoverable_resets_running_jobs() {
    let test_db = TestDb::new().await;

    let low = Job::new(JobType::LogRetention, serde_json::Value::Null)
        .with_priority(JobPriority::Low);
    let urgent = Job::new(JobType::Download, serde_json::Value::Null)
        .with_priority(JobPriority::Urgent);
    let interrupted = Job::new(JobType::LibraryScan, serde_json::Value::Null);
    let done = Job::new(JobType::LibraryScan, serde_json::Value::Null);
    for job in [&low, &urgent, &interrupted, &done] {
        jobs::insert(test_db.db(), job).await.unwrap();
    }
    jobs::mark_running(test_db.db(), &interrupted.id).await.unwrap();
    jobs::mark_running(test_db.db(), &done.id).await.unwrap();
    jobs::mark_completed(test_db.db(), &done.id, None).await.unwrap();

    let recovered = jobs::recoverable(test_db.db()).await.unwrap();
    let ids: Vec<_> = recovered.iter().map(|j| j.id.clone()).collect();
    assert_eq!(ids, vec![urgent.id, interrupted.id.clone(), low.id]);

    let reset = jobs::get(test_db.db(), &interrupted.id).await.unwrap().unwrap();
    assert_eq!(reset.status, JobStatus::Pending);
    // The interrupted attempt still counts
    assert_eq!(reset.attempts, 1);
}

#[tokio::test]
async fn test_list_and_counts_by_status() {
    let test_db = TestDb::new().await;
    let a = create_test_job(test_db.db(), JobType::Download).await;
    create_test_job(test_db.db(), JobType::Download).await;
    let c = create_test_job(test_db.db(), JobType::LibraryScan).await;
    jobs::mark_running(test_db.db(), &a.id).await.unwrap();
    jobs::mark_failed(test_db.db(), &c.id, "bad").await.unwrap();

    let counts = jobs::counts_by_status(test_db.db()).await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.running, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.total(), 3);
    assert_eq!(counts.get(JobStatus::Completed), 0);

    assert_eq!(jobs::list(test_db.db(), None, 10).await.unwrap().len(), 3);
    assert_eq!(jobs::list(test_db.db(), None, 2).await.unwrap().len(), 2);

    let failed = jobs::list(test_db.db(), Some(JobStatus::Failed), 10)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, c.id);
}

#[tokio::test]
async fn test_purge_finished_keeps_unfinished_jobs() {
    let test_db = TestDb::new().await;
    let pending = create_test_job(test_db.db(), JobType::Download).await;
    let done = create_test_job(test_db.db(), JobType::Download).await;
    jobs::mark_running(test_db.db(), &done.id).await.unwrap();
    jobs::mark_completed(test_db.db(), &done.id, None).await.unwrap();

    // Recent jobs survive a one-hour cutoff
    assert_eq!(
        jobs::purge_finished(test_db.db(), Duration::from_secs(3600))
            .await
            .unwrap(),
        0
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    let removed = jobs::purge_finished(test_db.db(), Duration::from_millis(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    assert!(jobs::get(test_db.db(), &done.id).await.unwrap().is_none());
    assert!(jobs::get(test_db.db(), &pending.id).await.unwrap().is_some());
}
