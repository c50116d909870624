//! Library scan job: index audio files under a directory

use super::JobHandler;
use crate::error::{JobError, Result};
use crate::pool::JobContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use soulspot_core::{JobType, TrackRecord};
use soulspot_metadata::{discover_audio_files, LoftyMetadataReader, DEFAULT_EXTENSIONS};
use soulspot_storage::tracks::TrackUpsert;
use soulspot_storage::WriteBuffer;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Progress is reported every this many files
const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryScanPayload {
    pub path: PathBuf,
}

pub struct LibraryScanHandler {
    tracks: WriteBuffer<TrackUpsert>,
    extensions: Vec<String>,
}

impl LibraryScanHandler {
    pub fn new(tracks: WriteBuffer<TrackUpsert>) -> Self {
        Self {
            tracks,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Override the file extensions considered audio
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        if !extensions.is_empty() {
            self.extensions = extensions;
        }
        self
    }
}

#[async_trait]
impl JobHandler for LibraryScanHandler {
    fn job_type(&self) -> JobType {
        JobType::LibraryScan
    }

    async fn handle(&self, ctx: &JobContext) -> Result<Option<serde_json::Value>> {
        let payload: LibraryScanPayload = ctx.payload()?;
        let root = payload.path;
        if root.as_os_str().is_empty() {
            return Err(JobError::InvalidPayload("empty scan path".to_string()));
        }

        info!(path = %root.display(), "Library scan started");

        let files = {
            let root = root.clone();
            let extensions = self.extensions.clone();
            tokio::task::spawn_blocking(move || discover_audio_files(&root, &extensions)).await??
        };
        let discovered = files.len();
        debug!(path = %root.display(), discovered, "Discovered audio files");

        let reader = LoftyMetadataReader::new();
        let mut indexed = 0usize;
        let mut failed = 0usize;

        for (i, file) in files.into_iter().enumerate() {
            if ctx.is_cancelled() {
                // Keep what was read so far
                if let Err(e) = self.tracks.flush().await {
                    warn!(error = %e, "Failed to flush tracks after cancelled scan");
                }
                return Err(JobError::Cancelled);
            }

            let path = file.clone();
            match tokio::task::spawn_blocking(move || reader.read(&path)).await? {
                Ok(tags) => {
                    self.tracks
                        .push(TrackUpsert(TrackRecord::from_tags(&file, tags)))
                        .await;
                    indexed += 1;
                }
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "Skipping unreadable file");
                    failed += 1;
                }
            }

            let done = i + 1;
            if done % PROGRESS_EVERY == 0 || done == discovered {
                let percent = done as f64 / discovered as f64 * 100.0;
                ctx.report_progress(percent, Some(&format!("{}/{} files", done, discovered)));
            }
        }

        self.tracks.flush().await?;

        info!(
            path = %root.display(),
            discovered,
            indexed,
            failed,
            "Library scan finished"
        );
        Ok(Some(serde_json::json!({
            "discovered": discovered,
            "indexed": indexed,
            "failed": failed,
        })))
    }
}
