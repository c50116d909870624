//! SoulSpot Jobs
//!
//! Background work for SoulSpot: downloads, library scans, provider syncs
//! and log retention.
//!
//! # Architecture
//!
//! - [`JobQueue`]: bounded in-memory priority queue (highest priority first,
//!   FIFO within a priority)
//! - [`WorkerPool`]: persists jobs, feeds them to worker tasks, retries
//!   failures with backoff and recovers interrupted jobs on start
//! - [`handlers`]: one [`JobHandler`] per [`JobType`](soulspot_core::JobType)
//!
//! Job state lives in the `jobs` table, so a restart loses nothing: anything
//! pending or running at shutdown is queued again by [`WorkerPool::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use soulspot_core::{Job, JobType};
//! use soulspot_jobs::{HandlerRegistry, WorkerPool, WorkerPoolConfig};
//! use soulspot_jobs::handlers::LibraryScanHandler;
//! use soulspot_storage::{Database, WriteBuffer, WriteBufferConfig};
//! use std::sync::Arc;
//!
//! # async fn example(db: Database) -> Result<(), Box<dyn std::error::Error>> {
//! let tracks = WriteBuffer::new("tracks", db.pool().clone(), db.retry().clone(), WriteBufferConfig::default());
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(Arc::new(LibraryScanHandler::new(tracks)));
//!
//! let pool = WorkerPool::new(db, registry, WorkerPoolConfig::default());
//! pool.start().await?;
//!
//! pool.submit(Job::new(JobType::LibraryScan, serde_json::json!({ "path": "/music" }))).await?;
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod error;
pub mod handlers;
mod pool;
mod queue;

pub use error::{JobError, Result};
pub use handlers::{HandlerRegistry, JobHandler};
pub use pool::{JobContext, JobEvent, PoolStats, WorkerPool, WorkerPoolConfig};
pub use queue::{JobQueue, QueueError};
