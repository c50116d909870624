//! Metadata sync job: pull an artist's tracks from a streaming provider

use super::JobHandler;
use crate::error::{JobError, Result};
use crate::pool::JobContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use soulspot_core::{JobType, MetadataProvider};
use soulspot_storage::tracks::TrackUpsert;
use soulspot_storage::WriteBuffer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSyncPayload {
    /// Provider name, matched case-insensitively
    pub provider: String,
    pub artist_id: String,
}

pub struct MetadataSyncHandler {
    providers: HashMap<String, Arc<dyn MetadataProvider>>,
    tracks: WriteBuffer<TrackUpsert>,
}

impl MetadataSyncHandler {
    pub fn new(tracks: WriteBuffer<TrackUpsert>) -> Self {
        Self {
            providers: HashMap::new(),
            tracks,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn MetadataProvider>) -> Self {
        self.providers
            .insert(provider.name().to_ascii_lowercase(), provider);
        self
    }

    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl JobHandler for MetadataSyncHandler {
    fn job_type(&self) -> JobType {
        JobType::MetadataSync
    }

    async fn handle(&self, ctx: &JobContext) -> Result<Option<serde_json::Value>> {
        let payload: MetadataSyncPayload = ctx.payload()?;
        let provider = self
            .providers
            .get(&payload.provider.to_ascii_lowercase())
            .ok_or_else(|| {
                JobError::InvalidPayload(format!("unknown provider: {}", payload.provider))
            })?;

        let fetched = tokio::select! {
            () = ctx.cancellation().cancelled() => return Err(JobError::Cancelled),
            result = provider.artist_tracks(&payload.artist_id) => result?,
        };

        let synced = fetched.len();
        for track in fetched {
            self.tracks.push(TrackUpsert(track.into_record())).await;
        }
        self.tracks.flush().await?;
        ctx.report_progress(100.0, None);

        info!(
            provider = %provider.name(),
            artist_id = %payload.artist_id,
            synced,
            "Metadata sync finished"
        );
        Ok(Some(serde_json::json!({ "synced": synced })))
    }
}
