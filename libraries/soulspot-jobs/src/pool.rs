//! Worker pool executing persisted jobs
//!
//! Every state change is written to the `jobs` table before it is announced
//! on the event channel, so a subscriber that sees an event can rely on the
//! database agreeing with it.

use crate::error::{JobError, Result};
use crate::handlers::{HandlerRegistry, JobHandler};
use crate::queue::{JobQueue, QueueError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use soulspot_core::{Job, JobId, JobPriority, JobStatus, JobType};
use soulspot_storage::jobs::{self, JobCounts};
use soulspot_storage::{Database, RetryConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker tasks
    pub workers: usize,
    pub queue_capacity: usize,
    /// Delay before a failed attempt runs again, by attempt number
    pub retry_backoff: RetryConfig,
    /// Upper bound for a single attempt
    pub job_timeout: Option<Duration>,
    /// How long a cancelled handler may keep running before it is dropped
    pub cancel_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 1000,
            retry_backoff: RetryConfig {
                max_attempts: u32::MAX,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(300),
                multiplier: 2.0,
                jitter: 0.0,
            },
            job_timeout: None,
            cancel_grace: Duration::from_secs(10),
        }
    }
}

/// Lifecycle notifications, broadcast to every [`WorkerPool::events`] receiver
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        job_id: JobId,
        job_type: JobType,
        priority: JobPriority,
    },
    Started {
        job_id: JobId,
        job_type: JobType,
        attempt: u32,
    },
    Progress {
        job_id: JobId,
        percent: f64,
        message: Option<String>,
    },
    Completed {
        job_id: JobId,
        result: Option<serde_json::Value>,
    },
    Failed {
        job_id: JobId,
        error: String,
        will_retry: bool,
    },
    Cancelled {
        job_id: JobId,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => job_id,
        }
    }
}

/// What a handler gets to see while it runs
pub struct JobContext {
    job: Job,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    events: broadcast::Sender<JobEvent>,
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken, events: broadcast::Sender<JobEvent>) -> Self {
        Self {
            job,
            cancel,
            shutdown: CancellationToken::new(),
            events,
        }
    }

    /// Tie the context to the pool's shutdown signal
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Deserialize the job payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True when the cancellation comes from the pool stopping
    ///
    /// Such a job goes back to pending and runs again after the next start,
    /// so handlers should leave their own records resumable.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// `Err(Cancelled)` once the job has been asked to stop
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Publish progress (0.0 - 100.0); not persisted
    pub fn report_progress(&self, percent: f64, message: Option<&str>) {
        let _ = self.events.send(JobEvent::Progress {
            job_id: self.job.id.clone(),
            percent: percent.clamp(0.0, 100.0),
            message: message.map(str::to_string),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Jobs waiting in memory for a worker
    pub queued: usize,
    /// Jobs currently executing in this process
    pub running: usize,
    pub workers: usize,
    /// Persisted jobs by status
    pub jobs: JobCounts,
}

struct Inner {
    db: Database,
    registry: HandlerRegistry,
    config: WorkerPoolConfig,
    queue: JobQueue,
    running: Mutex<HashMap<JobId, CancellationToken>>,
    events: broadcast::Sender<JobEvent>,
    shutdown: CancellationToken,
}

/// Runs persisted jobs on a fixed number of tokio tasks
pub struct WorkerPool {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(db: Database, registry: HandlerRegistry, config: WorkerPoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let queue = JobQueue::new(config.queue_capacity);

        Self {
            inner: Arc::new(Inner {
                db,
                registry,
                config,
                queue,
                running: Mutex::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.inner.config
    }

    /// Persist a job and queue it for execution
    ///
    /// A job rejected because the queue is full is marked failed. A job
    /// rejected because the pool is shutting down stays pending and runs
    /// after the next start.
    pub async fn submit(&self, job: Job) -> Result<JobId> {
        let db = &self.inner.db;
        jobs::insert(db, &job).await?;

        let id = job.id.clone();
        let job_type = job.job_type;
        let priority = job.priority;

        match self.inner.queue.push(job).await {
            Ok(()) => {}
            Err(err @ QueueError::Full(_)) => {
                warn!(job_id = %id, job_type = %job_type, "Job queue full, rejecting job");
                jobs::mark_failed(db, &id, &err.to_string()).await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        }

        debug!(job_id = %id, job_type = %job_type, ?priority, "Job queued");
        self.inner.emit(JobEvent::Queued {
            job_id: id.clone(),
            job_type,
            priority,
        });
        Ok(id)
    }

    /// Queue jobs left over from a previous run and spawn the workers
    ///
    /// Returns the number of recovered jobs.
    pub async fn start(&self) -> Result<usize> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Err(JobError::InvalidState(
                "worker pool already started".to_string(),
            ));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::InvalidState(
                "worker pool has been shut down".to_string(),
            ));
        }

        let pending = jobs::recoverable(&self.inner.db).await?;
        let mut recovered = 0;
        for job in pending {
            let id = job.id.clone();
            match self.inner.queue.push(job).await {
                Ok(()) => recovered += 1,
                // Submitted before start
                Err(QueueError::Duplicate(_)) => {}
                Err(QueueError::Full(capacity)) => {
                    // The rest stay pending in the database until the next start
                    warn!(capacity, job_id = %id, "Job queue full during recovery");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Recovered pending jobs");
        }

        let count = self.inner.config.workers.max(1);
        for worker_id in 0..count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                inner.worker_loop(worker_id).await;
            }));
        }
        info!(
            workers = count,
            handlers = ?self.inner.registry.job_types(),
            "Worker pool started"
        );

        Ok(recovered)
    }

    /// Cancel a queued or running job
    ///
    /// A queued job is cancelled immediately. A running job has its
    /// cancellation token triggered and is marked cancelled once its handler
    /// returns.
    pub async fn cancel(&self, id: &JobId) -> Result<()> {
        let db = &self.inner.db;

        if self.inner.queue.remove(id).await.is_some() {
            if jobs::mark_cancelled(db, id).await? {
                info!(job_id = %id, "Cancelled queued job");
                self.inner.emit(JobEvent::Cancelled { job_id: id.clone() });
            }
            return Ok(());
        }

        if let Some(token) = self.inner.running.lock().await.get(id) {
            info!(job_id = %id, "Cancelling running job");
            token.cancel();
            return Ok(());
        }

        // Waiting for a retry, or not ours at all
        match jobs::get(db, id).await? {
            None => Err(JobError::NotFound(format!("job {}", id))),
            Some(job) if job.status.is_terminal() => Err(JobError::InvalidState(format!(
                "job {} is already {}",
                id, job.status
            ))),
            Some(_) => {
                if jobs::mark_cancelled(db, id).await? {
                    info!(job_id = %id, "Cancelled job");
                    self.inner.emit(JobEvent::Cancelled { job_id: id.clone() });
                }
                Ok(())
            }
        }
    }

    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        Ok(PoolStats {
            queued: self.inner.queue.len().await,
            running: self.inner.running.lock().await.len(),
            workers: self.workers.lock().await.len(),
            jobs: jobs::counts_by_status(&self.inner.db).await?,
        })
    }

    /// Stop accepting work, cancel running jobs and wait for the workers
    ///
    /// Interrupted and still-queued jobs stay pending in the database.
    pub async fn shutdown(&self) {
        info!("Shutting down worker pool");
        self.inner.shutdown.cancel();
        self.inner.queue.close().await;

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

enum Outcome {
    Completed(Option<serde_json::Value>),
    Failed(JobError),
}

impl Inner {
    fn emit(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Job worker started");

        while let Some(job) = self.queue.pop().await {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.process(worker_id, job).await;
        }

        debug!(worker_id, "Job worker stopped");
    }

    async fn process(self: &Arc<Self>, worker_id: usize, queued: Job) {
        // The queued copy may be stale (cancelled, or finished by a retry race)
        let mut job = match jobs::get(&self.db, &queued.id).await {
            Ok(Some(job)) if job.status == JobStatus::Pending => job,
            Ok(_) => {
                debug!(job_id = %queued.id, "Skipping job that is no longer pending");
                return;
            }
            Err(e) => {
                error!(job_id = %queued.id, error = %e, "Failed to load job");
                return;
            }
        };

        let Some(handler) = self.registry.get(job.job_type) else {
            let err = JobError::NoHandler(job.job_type);
            warn!(job_id = %job.id, job_type = %job.job_type, "No handler registered");
            self.fail(&job, &err).await;
            return;
        };

        // Registered before the claim so a cancel in between reaches the token
        let token = self.shutdown.child_token();
        self.running
            .lock()
            .await
            .insert(job.id.clone(), token.clone());

        match jobs::mark_running(&self.db, &job.id).await {
            Ok(true) => {}
            Ok(false) => {
                self.running.lock().await.remove(&job.id);
                debug!(job_id = %job.id, "Job was claimed or cancelled before it started");
                return;
            }
            Err(e) => {
                self.running.lock().await.remove(&job.id);
                error!(job_id = %job.id, error = %e, "Failed to mark job running");
                return;
            }
        }
        job.status = JobStatus::Running;
        job.attempts += 1;

        info!(
            worker_id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Job started"
        );
        self.emit(JobEvent::Started {
            job_id: job.id.clone(),
            job_type: job.job_type,
            attempt: job.attempts,
        });

        let ctx = JobContext::new(job.clone(), token.clone(), self.events.clone())
            .with_shutdown(self.shutdown.clone());
        let outcome = match self.execute(handler.as_ref(), &ctx).await {
            Ok(result) => Outcome::Completed(result),
            Err(err) => Outcome::Failed(err),
        };

        self.running.lock().await.remove(&job.id);
        self.settle(job, outcome, &token).await;
    }

    async fn execute(
        &self,
        handler: &dyn JobHandler,
        ctx: &JobContext,
    ) -> Result<Option<serde_json::Value>> {
        let run = async {
            match self.config.job_timeout {
                Some(limit) => tokio::time::timeout(limit, handler.handle(ctx))
                    .await
                    .unwrap_or(Err(JobError::Timeout(limit))),
                None => handler.handle(ctx).await,
            }
        };

        // Handlers are expected to observe the token; one that does not is
        // dropped after the grace period.
        let grace = self.config.cancel_grace;
        let forced = async {
            ctx.cancellation().cancelled().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = run => result,
            () = forced => {
                warn!(job_id = %ctx.job().id, "Handler ignored cancellation, dropping it");
                Err(JobError::Cancelled)
            }
        }
    }

    async fn settle(self: &Arc<Self>, job: Job, outcome: Outcome, token: &CancellationToken) {
        let err = match outcome {
            Outcome::Completed(result) => {
                match jobs::mark_completed(&self.db, &job.id, result.as_ref()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(job_id = %job.id, "Job was cancelled while it ran");
                        return;
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                        return;
                    }
                }
                info!(job_id = %job.id, job_type = %job.job_type, "Job completed");
                self.emit(JobEvent::Completed {
                    job_id: job.id,
                    result,
                });
                return;
            }
            Outcome::Failed(err) => err,
        };

        if token.is_cancelled() {
            if self.shutdown.is_cancelled() {
                // Resume after restart
                match jobs::mark_pending(&self.db, &job.id, "Interrupted by shutdown").await {
                    Ok(true) => info!(job_id = %job.id, "Job interrupted by shutdown"),
                    Ok(false) => debug!(job_id = %job.id, "Interrupted job already settled"),
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to requeue interrupted job");
                    }
                }
                return;
            }

            match jobs::mark_cancelled(&self.db, &job.id).await {
                Ok(true) => {
                    info!(job_id = %job.id, "Job cancelled");
                    self.emit(JobEvent::Cancelled { job_id: job.id });
                }
                Ok(false) => debug!(job_id = %job.id, "Cancelled job already settled"),
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job cancelled"),
            }
            return;
        }

        let will_retry = err.is_retryable() && job.can_retry();
        if !will_retry {
            self.fail(&job, &err).await;
            return;
        }

        match jobs::mark_pending(&self.db, &job.id, &err.to_string()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "Job left running before its retry, not retrying");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to schedule job retry");
                return;
            }
        }

        let delay = self.config.retry_backoff.delay_for(job.attempts);
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Job failed, retrying"
        );
        self.emit(JobEvent::Failed {
            job_id: job.id.clone(),
            error: err.to_string(),
            will_retry: true,
        });
        self.schedule_retry(job, delay);
    }

    fn schedule_retry(self: &Arc<Self>, mut job: Job, delay: Duration) {
        job.status = JobStatus::Pending;
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            tokio::select! {
                // Still pending in the database; recovered on next start
                () = inner.shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let id = job.id.clone();
                    if let Err(e) = inner.queue.push(job).await {
                        warn!(job_id = %id, error = %e, "Could not requeue job for retry");
                    }
                }
            }
        });
    }

    async fn fail(&self, job: &Job, err: &JobError) {
        match jobs::mark_failed(&self.db, &job.id, &err.to_string()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job.id, "Job already settled, not marking it failed");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to mark job failed");
                return;
            }
        }
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            error = %err,
            "Job failed"
        );
        self.emit(JobEvent::Failed {
            job_id: job.id.clone(),
            error: err.to_string(),
            will_retry: false,
        });
    }
}
