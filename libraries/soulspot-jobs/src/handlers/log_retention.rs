//! Log retention job: prune the logs database and old finished jobs

use super::JobHandler;
use crate::error::Result;
use crate::pool::JobContext;
use async_trait::async_trait;
use soulspot_core::JobType;
use soulspot_storage::jobs;
use soulspot_storage::logs::LogStore;
use soulspot_storage::Database;
use std::time::Duration;
use tracing::info;

pub struct LogRetentionHandler {
    logs: LogStore,
    db: Database,
    retention: Duration,
}

impl LogRetentionHandler {
    /// Log rows and finished jobs older than `retention` are deleted
    pub fn new(logs: LogStore, db: Database, retention: Duration) -> Self {
        Self { logs, db, retention }
    }
}

#[async_trait]
impl JobHandler for LogRetentionHandler {
    fn job_type(&self) -> JobType {
        JobType::LogRetention
    }

    async fn handle(&self, ctx: &JobContext) -> Result<Option<serde_json::Value>> {
        let removed = self.logs.prune_older_than(self.retention).await?;
        ctx.check_cancelled()?;
        let purged_jobs = jobs::purge_finished(&self.db, self.retention).await?;

        info!(
            removed,
            purged_jobs,
            retention_days = self.retention.as_secs() / 86_400,
            "Log retention finished"
        );
        Ok(Some(serde_json::json!({
            "removed": removed,
            "purged_jobs": purged_jobs,
        })))
    }
}
