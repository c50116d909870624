//! Download job: drive one transfer through the download backend

use super::JobHandler;
use crate::error::{JobError, Result};
use crate::pool::JobContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use soulspot_core::{
    Download, DownloadBackend, DownloadId, DownloadStatus, JobType, TrackTags, TransferState,
    TransferStatus,
};
use soulspot_metadata::TagWriter;
use soulspot_storage::downloads::{self, DownloadProgressUpdate};
use soulspot_storage::{Database, WriteBuffer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub download_id: DownloadId,
    /// Written into the finished file when present
    #[serde(default)]
    pub tags: Option<TrackTags>,
}

#[derive(Debug, Clone)]
pub struct DownloadHandlerConfig {
    pub poll_interval: Duration,
    /// Fail a transfer whose byte count has not moved for this long
    pub stall_timeout: Duration,
}

impl Default for DownloadHandlerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(300),
        }
    }
}

pub struct DownloadHandler {
    db: Database,
    backend: Arc<dyn DownloadBackend>,
    progress: WriteBuffer<DownloadProgressUpdate>,
    config: DownloadHandlerConfig,
}

impl DownloadHandler {
    pub fn new(
        db: Database,
        backend: Arc<dyn DownloadBackend>,
        progress: WriteBuffer<DownloadProgressUpdate>,
    ) -> Self {
        Self {
            db,
            backend,
            progress,
            config: DownloadHandlerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DownloadHandlerConfig) -> Self {
        self.config = config;
        self
    }

    async fn flush_progress(&self) {
        if let Err(e) = self.progress.flush().await {
            warn!(error = %e, "Failed to flush download progress");
        }
    }

    /// Record a final status after any buffered progress has landed
    async fn finish(
        &self,
        id: &DownloadId,
        status: DownloadStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.flush_progress().await;
        downloads::update_status(&self.db, id, status, error).await?;
        Ok(())
    }

    async fn fail(&self, id: &DownloadId, err: JobError) -> JobError {
        if let Err(e) = self
            .finish(id, DownloadStatus::Failed, Some(&err.to_string()))
            .await
        {
            warn!(download_id = %id, error = %e, "Failed to mark download failed");
        }
        err
    }

    async fn abort_transfer(&self, transfer_id: &str) {
        if let Err(e) = self.backend.cancel(transfer_id).await {
            warn!(transfer_id, error = %e, "Failed to cancel transfer");
        }
    }

    /// Poll until the transfer finishes, is cancelled, or stalls
    async fn watch(
        &self,
        ctx: &JobContext,
        download: &Download,
        transfer_id: &str,
    ) -> Result<TransferState> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_bytes = -1;
        let mut last_change = Instant::now();

        loop {
            tokio::select! {
                () = ctx.cancellation().cancelled() => {
                    self.abort_transfer(transfer_id).await;
                    if ctx.is_shutting_down() {
                        // The job is requeued; the next attempt starts a fresh transfer
                        self.finish(&download.id, DownloadStatus::Queued, None).await?;
                        info!(download_id = %download.id, "Download interrupted by shutdown");
                    } else {
                        self.finish(&download.id, DownloadStatus::Cancelled, None).await?;
                        info!(download_id = %download.id, "Download cancelled");
                    }
                    return Err(JobError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            let state = self.backend.status(transfer_id).await?;
            if state.status.is_finished() {
                return Ok(state);
            }

            if state.bytes_transferred > last_bytes {
                last_bytes = state.bytes_transferred;
                last_change = Instant::now();
            } else if last_change.elapsed() >= self.config.stall_timeout {
                self.abort_transfer(transfer_id).await;
                return Err(JobError::Provider(format!(
                    "Transfer stalled at {} bytes for {:?}",
                    state.bytes_transferred, self.config.stall_timeout
                )));
            }

            let status = match state.status {
                TransferStatus::InProgress => DownloadStatus::Downloading,
                _ => DownloadStatus::Searching,
            };
            let percent = state.percent();
            self.progress
                .push(DownloadProgressUpdate {
                    bytes_transferred: state.bytes_transferred,
                    size_bytes: state.size_bytes,
                    progress: percent,
                    ..DownloadProgressUpdate::new(download.id.clone(), status)
                })
                .await;
            ctx.report_progress(percent, Some(status.as_str()));
        }
    }

    /// Tagging failures are logged and do not fail the download
    async fn write_tags(&self, path: Option<PathBuf>, tags: Option<TrackTags>) -> bool {
        let (Some(path), Some(tags)) = (path, tags) else {
            return false;
        };
        if tags.is_empty() {
            return false;
        }

        let shown = path.display().to_string();
        match tokio::task::spawn_blocking(move || TagWriter::new().write(&path, &tags)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(path = %shown, error = %e, "Failed to tag downloaded file");
                false
            }
            Err(e) => {
                warn!(path = %shown, error = %e, "Tagging task failed");
                false
            }
        }
    }
}

#[async_trait]
impl JobHandler for DownloadHandler {
    fn job_type(&self) -> JobType {
        JobType::Download
    }

    async fn handle(&self, ctx: &JobContext) -> Result<Option<serde_json::Value>> {
        let payload: DownloadPayload = ctx.payload()?;
        let id = &payload.download_id;

        let download = downloads::get(&self.db, id)
            .await?
            .ok_or_else(|| JobError::NotFound(format!("download {}", id)))?;

        match download.status {
            DownloadStatus::Completed | DownloadStatus::Cancelled => {
                info!(
                    download_id = %id,
                    status = %download.status,
                    "Download already finished, skipping"
                );
                return Ok(Some(serde_json::json!({
                    "download_id": id,
                    "status": download.status,
                    "skipped": true,
                })));
            }
            DownloadStatus::Failed => {
                debug!(download_id = %id, "Retrying failed download");
            }
            _ => {}
        }

        ctx.check_cancelled()?;
        downloads::update_status(&self.db, id, DownloadStatus::Searching, None).await?;

        let transfer_id = match self
            .backend
            .start(&download.username, &download.filename)
            .await
        {
            Ok(transfer_id) => transfer_id,
            Err(e) => return Err(self.fail(id, e.into()).await),
        };
        info!(
            download_id = %id,
            transfer_id = %transfer_id,
            username = %download.username,
            filename = %download.filename,
            "Transfer started"
        );

        let state = match self.watch(ctx, &download, &transfer_id).await {
            Ok(state) => state,
            Err(JobError::Cancelled) => return Err(JobError::Cancelled),
            Err(e) => return Err(self.fail(id, e).await),
        };

        match state.status {
            TransferStatus::Succeeded => {
                // Final byte count lands with the flush in `finish`
                self.progress
                    .push(DownloadProgressUpdate {
                        bytes_transferred: state.bytes_transferred,
                        size_bytes: state.size_bytes,
                        progress: 100.0,
                        ..DownloadProgressUpdate::new(id.clone(), DownloadStatus::Downloading)
                    })
                    .await;
                self.finish(id, DownloadStatus::Completed, None).await?;

                let path = state
                    .local_path
                    .clone()
                    .or_else(|| download.target_path.clone())
                    .map(PathBuf::from);
                let tagged = self.write_tags(path, payload.tags.clone()).await;

                info!(
                    download_id = %id,
                    bytes = state.bytes_transferred,
                    tagged,
                    "Download completed"
                );
                Ok(Some(serde_json::json!({
                    "download_id": id,
                    "transfer_id": transfer_id,
                    "bytes": state.bytes_transferred,
                    "local_path": state.local_path,
                    "tagged": tagged,
                })))
            }
            TransferStatus::Cancelled => Err(self
                .fail(id, JobError::Provider("Transfer cancelled by peer".to_string()))
                .await),
            _ => {
                let reason = state
                    .error
                    .unwrap_or_else(|| "Transfer failed".to_string());
                Err(self.fail(id, JobError::Provider(reason)).await)
            }
        }
    }
}
