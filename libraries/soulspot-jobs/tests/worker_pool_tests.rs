//! Integration tests for the worker pool
//!
//! Tests the job lifecycle end to end:
//! - Completion, retry with backoff and permanent failure
//! - Priority ordering and crash recovery
//! - Cancellation, timeouts and graceful shutdown

mod common;

use async_trait::async_trait;
use common::*;
use serde::Deserialize;
use soulspot_core::{
    Download, DownloadBackend, DownloadStatus, Job, JobPriority, JobStatus, JobType,
    TransferStatus,
};
use soulspot_jobs::handlers::{DownloadHandler, DownloadHandlerConfig};
use soulspot_jobs::{
    HandlerRegistry, JobContext, JobError, JobEvent, JobHandler, QueueError, WorkerPool,
};
use soulspot_storage::{downloads, jobs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    attempts: AtomicUsize,
    order: Mutex<Vec<String>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Behaviour {
    label: String,
    fail_times: usize,
    permanent: bool,
    sleep_ms: u64,
    ignore_cancel: bool,
}

struct ScriptedHandler {
    job_type: JobType,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    async fn handle(&self, ctx: &JobContext) -> soulspot_jobs::Result<Option<serde_json::Value>> {
        let behaviour: Behaviour = ctx.payload()?;
        let attempt = self.recorder.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder
            .order
            .lock()
            .unwrap()
            .push(behaviour.label.clone());

        if behaviour.sleep_ms > 0 {
            let sleep = tokio::time::sleep(Duration::from_millis(behaviour.sleep_ms));
            if behaviour.ignore_cancel {
                sleep.await;
            } else {
                tokio::select! {
                    () = ctx.cancellation().cancelled() => return Err(JobError::Cancelled),
                    () = sleep => {}
                }
            }
        }

        if behaviour.permanent {
            return Err(JobError::InvalidPayload("bad input".to_string()));
        }
        if attempt <= behaviour.fail_times {
            return Err(JobError::Provider(format!("attempt {} failed", attempt)));
        }
        Ok(Some(serde_json::json!({ "attempt": attempt })))
    }
}

fn setup(env: &TestEnv, config: soulspot_jobs::WorkerPoolConfig) -> (WorkerPool, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(ScriptedHandler {
        job_type: JobType::LibraryScan,
        recorder: Arc::clone(&recorder),
    }));
    (WorkerPool::new(env.db.clone(), registry, config), recorder)
}

fn scripted(payload: serde_json::Value) -> Job {
    Job::new(JobType::LibraryScan, payload)
}

fn download_pool(env: &TestEnv, backend: Arc<FakeBackend>) -> WorkerPool {
    let handler = DownloadHandler::new(
        env.db.clone(),
        backend as Arc<dyn DownloadBackend>,
        env.buffer("downloads"),
    )
    .with_config(DownloadHandlerConfig {
        poll_interval: Duration::from_millis(10),
        stall_timeout: Duration::from_secs(60),
    });
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(handler));
    WorkerPool::new(env.db.clone(), registry, pool_config(1))
}

#[tokio::test]
async fn test_submitted_job_runs_to_completion() {
    let env = TestEnv::new().await;
    let (pool, recorder) = setup(&env, pool_config(2));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool.submit(scripted(serde_json::json!({}))).await.unwrap();

    let event = wait_for_event(&mut events, |e| {
        matches!(e, JobEvent::Completed { .. }) && e.job_id() == &id
    })
    .await;
    assert_eq!(
        event,
        JobEvent::Completed {
            job_id: id.clone(),
            result: Some(serde_json::json!({ "attempt": 1 })),
        }
    );

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.result, Some(serde_json::json!({ "attempt": 1 })));
    assert!(job.completed_at.is_some());
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let env = TestEnv::new().await;
    let (pool, recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(scripted(serde_json::json!({ "fail_times": 2 })).with_max_attempts(3))
        .await
        .unwrap();

    let retry = wait_for_event(&mut events, |e| matches!(e, JobEvent::Failed { .. })).await;
    assert!(matches!(retry, JobEvent::Failed { will_retry: true, .. }));

    wait_for_event(&mut events, |e| matches!(e, JobEvent::Completed { .. })).await;

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.is_none());
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_attempts_mark_job_failed() {
    let env = TestEnv::new().await;
    let (pool, _recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(scripted(serde_json::json!({ "fail_times": 10 })).with_max_attempts(2))
        .await
        .unwrap();

    let event = wait_for_event(&mut events, |e| {
        matches!(e, JobEvent::Failed { will_retry: false, .. })
    })
    .await;
    assert_eq!(event.job_id(), &id);

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(
        job.last_error.as_deref(),
        Some("Provider error: attempt 2 failed")
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let env = TestEnv::new().await;
    let (pool, recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(scripted(serde_json::json!({ "permanent": true })).with_max_attempts(5))
        .await
        .unwrap();

    wait_for_event(&mut events, |e| matches!(e, JobEvent::Failed { will_retry: false, .. })).await;

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_job_without_handler_fails() {
    let env = TestEnv::new().await;
    let (pool, _recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(Job::new(JobType::LogRetention, serde_json::json!({})))
        .await
        .unwrap();

    wait_for_event(&mut events, |e| matches!(e, JobEvent::Failed { .. })).await;

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 0);
    assert_eq!(
        job.last_error.as_deref(),
        Some("No handler registered for job type log_retention")
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn test_jobs_run_in_priority_order() {
    let env = TestEnv::new().await;
    let (pool, recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();

    for (label, priority) in [
        ("normal-1", JobPriority::Normal),
        ("low", JobPriority::Low),
        ("urgent", JobPriority::Urgent),
        ("normal-2", JobPriority::Normal),
        ("high", JobPriority::High),
    ] {
        pool.submit(scripted(serde_json::json!({ "label": label })).with_priority(priority))
            .await
            .unwrap();
    }

    // Everything is already queued, nothing to recover
    assert_eq!(pool.start().await.unwrap(), 0);

    for _ in 0..5 {
        wait_for_event(&mut events, |e| matches!(e, JobEvent::Completed { .. })).await;
    }

    let order = recorder.order.lock().unwrap().clone();
    assert_eq!(order, vec!["urgent", "high", "normal-1", "normal-2", "low"]);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_start_recovers_interrupted_jobs() {
    let env = TestEnv::new().await;

    // Left behind by a crashed process
    let interrupted = scripted(serde_json::json!({ "label": "interrupted" }));
    jobs::insert(&env.db, &interrupted).await.unwrap();
    jobs::mark_running(&env.db, &interrupted.id).await.unwrap();
    let waiting = scripted(serde_json::json!({ "label": "waiting" }));
    jobs::insert(&env.db, &waiting).await.unwrap();

    let (pool, recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    assert_eq!(pool.start().await.unwrap(), 2);

    for _ in 0..2 {
        wait_for_event(&mut events, |e| matches!(e, JobEvent::Completed { .. })).await;
    }

    let job = jobs::get(&env.db, &interrupted.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 2);

    assert!(matches!(
        pool.start().await,
        Err(JobError::InvalidState(_))
    ));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let env = TestEnv::new().await;
    let (pool, recorder) = setup(&env, pool_config(1));

    let id = pool.submit(scripted(serde_json::json!({}))).await.unwrap();
    pool.cancel(&id).await.unwrap();

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(pool.stats().await.unwrap().queued, 0);

    assert!(matches!(
        pool.cancel(&id).await,
        Err(JobError::InvalidState(_))
    ));
    assert!(matches!(
        pool.cancel(&soulspot_core::JobId::new("missing")).await,
        Err(JobError::NotFound(_))
    ));

    pool.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_job() {
    let env = TestEnv::new().await;
    let (pool, _recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(scripted(serde_json::json!({ "sleep_ms": 10_000 })))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, JobEvent::Started { .. })).await;
    assert_eq!(pool.stats().await.unwrap().running, 1);

    pool.cancel(&id).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, JobEvent::Cancelled { .. })).await;

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.attempts, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_run_is_not_overwritten_by_completion() {
    let env = TestEnv::new().await;
    let (pool, recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(scripted(serde_json::json!({ "sleep_ms": 300 })))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, JobEvent::Started { .. })).await;

    // Another process cancels through the database while the handler runs
    assert!(jobs::mark_cancelled(&env.db, &id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(recorder.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().await.unwrap().running, 0);

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result.is_none());
    assert!(
        !matches!(events.try_recv(), Ok(JobEvent::Completed { .. })),
        "completion must not be announced for a cancelled job"
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn test_handler_ignoring_cancellation_is_dropped() {
    let env = TestEnv::new().await;
    let (pool, _recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(scripted(
            serde_json::json!({ "sleep_ms": 10_000, "ignore_cancel": true }),
        ))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, JobEvent::Started { .. })).await;

    pool.cancel(&id).await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, JobEvent::Cancelled { .. })).await;

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_timeout_fails_attempt() {
    let env = TestEnv::new().await;
    let config = soulspot_jobs::WorkerPoolConfig {
        job_timeout: Some(Duration::from_millis(50)),
        ..pool_config(1)
    };
    let (pool, _recorder) = setup(&env, config);
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(scripted(serde_json::json!({ "sleep_ms": 5_000 })).with_max_attempts(1))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, JobEvent::Failed { .. })).await;

    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("timed out"));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_leaves_interrupted_job_pending() {
    let env = TestEnv::new().await;
    let (pool, _recorder) = setup(&env, pool_config(1));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let running = pool
        .submit(scripted(serde_json::json!({ "sleep_ms": 10_000 })))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| matches!(e, JobEvent::Started { .. })).await;
    let queued = pool.submit(scripted(serde_json::json!({}))).await.unwrap();

    pool.shutdown().await;

    let job = jobs::get(&env.db, &running).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_error.as_deref(), Some("Interrupted by shutdown"));

    let job = jobs::get(&env.db, &queued).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);

    // Both come back on the next start
    let ids: Vec<_> = jobs::recoverable(&env.db)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&running) && ids.contains(&queued));

    assert!(matches!(
        pool.submit(scripted(serde_json::json!({}))).await,
        Err(JobError::Queue(QueueError::Closed))
    ));
}

#[tokio::test]
async fn test_full_queue_rejects_and_fails_job() {
    let env = TestEnv::new().await;
    let config = soulspot_jobs::WorkerPoolConfig {
        queue_capacity: 1,
        ..pool_config(1)
    };
    let (pool, _recorder) = setup(&env, config);

    pool.submit(scripted(serde_json::json!({}))).await.unwrap();

    let rejected = scripted(serde_json::json!({}));
    let rejected_id = rejected.id.clone();
    assert!(matches!(
        pool.submit(rejected).await,
        Err(JobError::Queue(QueueError::Full(1)))
    ));

    let job = jobs::get(&env.db, &rejected_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let stats = pool.stats().await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.workers, 0);
    assert_eq!(stats.jobs.pending, 1);
    assert_eq!(stats.jobs.failed, 1);
}

#[tokio::test]
async fn test_download_interrupted_by_shutdown_resumes_on_restart() {
    let env = TestEnv::new().await;
    let download = Download::new("peer", "Music\\Artist\\01 - Song.wav");
    downloads::create(&env.db, &download).await.unwrap();

    let stuck = Arc::new(FakeBackend::new(vec![transfer(
        TransferStatus::InProgress,
        10,
        100,
    )]));
    let pool = download_pool(&env, Arc::clone(&stuck));
    let mut events = pool.events();
    pool.start().await.unwrap();

    let id = pool
        .submit(Job::new(
            JobType::Download,
            serde_json::json!({ "download_id": download.id }),
        ))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| {
        matches!(e, JobEvent::Progress { .. }) && e.job_id() == &id
    })
    .await;
    pool.shutdown().await;

    assert_eq!(stuck.cancelled.load(Ordering::SeqCst), 1);
    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.last_error.as_deref(), Some("Interrupted by shutdown"));
    let stored = downloads::get(&env.db, &download.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Queued);

    // Next start picks the download up again with a fresh transfer
    let finishing = Arc::new(FakeBackend::new(vec![transfer(
        TransferStatus::Succeeded,
        100,
        100,
    )]));
    let pool = download_pool(&env, Arc::clone(&finishing));
    let mut events = pool.events();
    assert_eq!(pool.start().await.unwrap(), 1);

    let event = wait_for_event(&mut events, |e| {
        matches!(e, JobEvent::Completed { .. }) && e.job_id() == &id
    })
    .await;
    let JobEvent::Completed {
        result: Some(result),
        ..
    } = event
    else {
        panic!("expected a completion with a result");
    };
    assert!(result.get("skipped").is_none());
    assert_eq!(result["bytes"], 100);
    assert_eq!(finishing.started.load(Ordering::SeqCst), 1);

    let stored = downloads::get(&env.db, &download.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DownloadStatus::Completed);
    let job = jobs::get(&env.db, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);

    pool.shutdown().await;
}
