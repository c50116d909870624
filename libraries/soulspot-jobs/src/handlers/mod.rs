//! Job handlers
//!
//! One handler per [`JobType`]. Handlers read their payload from the
//! [`JobContext`], watch its cancellation token, and return an optional JSON
//! result that is stored on the job row.

mod download;
mod library_scan;
mod log_retention;
mod metadata_sync;

pub use download::{DownloadHandler, DownloadHandlerConfig, DownloadPayload};
pub use library_scan::{LibraryScanHandler, LibraryScanPayload};
pub use log_retention::LogRetentionHandler;
pub use metadata_sync::{MetadataSyncHandler, MetadataSyncPayload};

use crate::error::Result;
use crate::pool::JobContext;
use async_trait::async_trait;
use soulspot_core::JobType;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn handle(&self, ctx: &JobContext) -> Result<Option<serde_json::Value>>;
}

/// Handlers by job type; registering a type twice replaces the first handler
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Registered types in declaration order
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|job_type| self.handlers.contains_key(job_type))
            .collect()
    }
}
