//! Daemon assembly and lifecycle
//!
//! [`DaemonBuilder::build`] opens both databases and wires the write
//! buffers, handlers and worker pool. [`Daemon::start`] launches the
//! background tasks, [`Daemon::shutdown`] stops them in dependency order:
//! workers first so no handler pushes into a stopped buffer, then the
//! flushers and the log writer, then the pools.

use crate::config::SoulSpotConfig;
use crate::error::{DaemonError, Result};
use crate::telemetry::LogSink;
use serde::Serialize;
use soulspot_core::{DownloadBackend, Job, JobPriority, JobType, MetadataProvider};
use soulspot_jobs::handlers::{
    DownloadHandler, LibraryScanHandler, LibraryScanPayload, LogRetentionHandler,
    MetadataSyncHandler,
};
use soulspot_jobs::{HandlerRegistry, JobEvent, PoolStats, WorkerPool};
use soulspot_storage::downloads::DownloadProgressUpdate;
use soulspot_storage::logs::{LogStore, LogWriter};
use soulspot_storage::tracks::{self, TrackUpsert};
use soulspot_storage::{
    Database, LockMetrics, LockMetricsSnapshot, WriteBuffer, WriteBufferStats,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often a log retention job is queued while running
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Create the directory holding a file-backed SQLite database
pub fn ensure_database_dir(url: &str) -> Result<()> {
    let Some(path) = sqlite_file_path(url) else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn sqlite_file_path(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Open the library database described by `config`
pub async fn open_database(config: &SoulSpotConfig) -> Result<Database> {
    ensure_database_dir(&config.database.url)?;
    let db = Database::connect(
        &config.database.url,
        &config.database.pool_settings(),
        config.retry.retry_config(),
    )
    .await?;
    Ok(db)
}

/// Open the logs database described by `config`
pub async fn open_log_store(config: &SoulSpotConfig) -> Result<LogStore> {
    ensure_database_dir(&config.database.logs_url)?;
    let store = LogStore::open(
        &config.database.logs_url,
        &config.database.pool_settings(),
        config.retry.retry_config(),
    )
    .await?;
    Ok(store)
}

pub struct DaemonBuilder {
    config: SoulSpotConfig,
    log_sink: Option<LogSink>,
    backend: Option<Arc<dyn DownloadBackend>>,
    providers: Vec<Arc<dyn MetadataProvider>>,
}

impl DaemonBuilder {
    pub fn new(config: SoulSpotConfig) -> Self {
        Self {
            config,
            log_sink: None,
            backend: None,
            providers: Vec::new(),
        }
    }

    /// Drain records from the database log layer into the logs database
    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Enables download jobs
    pub fn with_download_backend(mut self, backend: Arc<dyn DownloadBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_metadata_provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub async fn build(self) -> Result<Daemon> {
        let config = self.config;
        config.validate()?;

        let db = open_database(&config).await?;
        let logs = open_log_store(&config).await?;
        info!(
            database = %config.database.url,
            logs = %config.database.logs_url,
            "Databases ready"
        );

        let buffer_config = config.write_buffer.buffer_config();
        let tracks: WriteBuffer<TrackUpsert> = WriteBuffer::new(
            "tracks",
            db.pool().clone(),
            db.retry().clone(),
            buffer_config.clone(),
        );
        let progress: WriteBuffer<DownloadProgressUpdate> = WriteBuffer::new(
            "download_progress",
            db.pool().clone(),
            db.retry().clone(),
            buffer_config,
        );

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(
            LibraryScanHandler::new(tracks.clone())
                .with_extensions(config.library.extensions.clone()),
        ));
        registry.register(Arc::new(LogRetentionHandler::new(
            logs.clone(),
            db.clone(),
            config.logging.retention(),
        )));

        let mut sync = MetadataSyncHandler::new(tracks.clone());
        for provider in self.providers {
            sync = sync.with_provider(provider);
        }
        registry.register(Arc::new(sync));

        if let Some(backend) = self.backend {
            registry.register(Arc::new(DownloadHandler::new(
                db.clone(),
                backend,
                progress.clone(),
            )));
        } else {
            debug!("No download backend configured, download jobs will fail");
        }

        let pool = Arc::new(WorkerPool::new(
            db.clone(),
            registry,
            config.workers.pool_config(),
        ));

        let dropped_logs = self
            .log_sink
            .as_ref()
            .map_or_else(|| Arc::new(AtomicU64::new(0)), |s| Arc::clone(&s.dropped));

        Ok(Daemon {
            config,
            db,
            logs,
            tracks,
            progress,
            pool,
            log_sink: self.log_sink,
            dropped_logs,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            started: false,
        })
    }
}

/// Point-in-time view of the daemon
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStats {
    pub pool: PoolStats,
    pub tracks: i64,
    pub log_records: i64,
    pub dropped_logs: u64,
    pub lock_metrics: LockMetricsSnapshot,
    pub tracks_buffer: WriteBufferStats,
    pub progress_buffer: WriteBufferStats,
}

pub struct Daemon {
    config: SoulSpotConfig,
    db: Database,
    logs: LogStore,
    tracks: WriteBuffer<TrackUpsert>,
    progress: WriteBuffer<DownloadProgressUpdate>,
    pool: Arc<WorkerPool>,
    log_sink: Option<LogSink>,
    dropped_logs: Arc<AtomicU64>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl Daemon {
    pub fn config(&self) -> &SoulSpotConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn log_store(&self) -> &LogStore {
        &self.logs
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.pool.events()
    }

    /// Launch background tasks, recover interrupted jobs and queue the
    /// startup work
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(DaemonError::InvalidInput(
                "daemon already started".to_string(),
            ));
        }
        self.started = true;

        self.tasks.push(self.tracks.spawn_flusher(self.shutdown.clone()));
        self.tasks
            .push(self.progress.spawn_flusher(self.shutdown.clone()));

        if let Some(sink) = self.log_sink.take() {
            let writer = LogWriter::new(
                self.logs.clone(),
                sink.receiver,
                self.config.logging.writer_config(),
            );
            self.tasks.push(writer.spawn(self.shutdown.clone()));
        }

        let recovered = self.pool.start().await?;

        let mut scans = 0;
        if self.config.library.scan_on_start {
            for path in &self.config.library.scan_paths {
                if !path.is_dir() {
                    warn!(path = %path.display(), "Skipping missing library path");
                    continue;
                }
                self.pool.submit(self.scan_job(path)?).await?;
                scans += 1;
            }
        }

        self.tasks.push(spawn_retention_ticker(
            Arc::clone(&self.pool),
            self.config.workers.max_job_attempts,
            self.shutdown.clone(),
        ));

        info!(recovered, scans, "SoulSpot daemon started");
        Ok(())
    }

    fn scan_job(&self, path: &Path) -> Result<Job> {
        let payload = serde_json::to_value(LibraryScanPayload {
            path: path.to_path_buf(),
        })
        .map_err(|e| DaemonError::InvalidInput(e.to_string()))?;
        Ok(Job::new(JobType::LibraryScan, payload)
            .with_max_attempts(self.config.workers.max_job_attempts))
    }

    /// Persist and queue a library scan of `path`
    ///
    /// The path is stored canonicalized, like the offline `enqueue-scan`.
    pub async fn enqueue_scan(&self, path: &Path, priority: JobPriority) -> Result<Job> {
        if !path.is_dir() {
            return Err(DaemonError::InvalidInput(format!(
                "not a directory: {}",
                path.display()
            )));
        }
        let path = path.canonicalize()?;
        let job = self.scan_job(&path)?.with_priority(priority);
        self.pool.submit(job.clone()).await?;
        Ok(job)
    }

    pub async fn stats(&self) -> Result<DaemonStats> {
        Ok(DaemonStats {
            pool: self.pool.stats().await?,
            tracks: tracks::count(&self.db).await?,
            log_records: self.logs.count().await?,
            dropped_logs: self.dropped_logs.load(Ordering::Relaxed),
            lock_metrics: LockMetrics::global().snapshot(),
            tracks_buffer: self.tracks.stats().await,
            progress_buffer: self.progress.stats().await,
        })
    }

    /// Stop workers, drain buffers and close both databases
    pub async fn shutdown(mut self) {
        info!("Shutting down SoulSpot daemon");
        self.pool.shutdown().await;

        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Background task panicked");
            }
        }

        // Flushers write on cancellation; catch anything pushed after that
        for (name, result) in [
            ("tracks", self.tracks.flush().await),
            ("download_progress", self.progress.flush().await),
        ] {
            if let Err(e) = result {
                error!(buffer = name, error = %e, "Final flush failed");
            }
        }

        self.logs.close().await;
        self.db.close().await;
        info!("SoulSpot daemon stopped");
    }
}

fn spawn_retention_ticker(
    pool: Arc<WorkerPool>,
    max_attempts: u32,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First tick fires immediately, covering the startup pass
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let job = Job::new(JobType::LogRetention, serde_json::json!({}))
                        .with_priority(JobPriority::Low)
                        .with_max_attempts(max_attempts);
                    if let Err(e) = pool.submit(job).await {
                        warn!(error = %e, "Failed to queue log retention");
                    }
                }
            }
        }
    })
}
