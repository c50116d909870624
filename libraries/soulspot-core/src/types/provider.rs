//! Provider DTOs
//!
//! Normalized shapes of provider API responses, filled in by
//! [`MetadataProvider`](crate::traits::MetadataProvider) implementations
//! before anything touches the database.

use super::track::TrackRecord;
use serde::{Deserialize, Serialize};

/// A track as described by a streaming/metadata provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderTrack {
    /// Provider name, e.g. "spotify", "deezer", "musicbrainz"
    pub provider: String,
    pub external_id: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<u32>,
    pub duration_ms: Option<u64>,
    pub isrc: Option<String>,
}

impl ProviderTrack {
    /// Map into a library row keyed by provider and external id
    pub fn into_record(self) -> TrackRecord {
        let provider = self.provider.to_ascii_lowercase();
        let mut record = TrackRecord {
            track_key: TrackRecord::provider_key(&provider, &self.external_id),
            title: self.title,
            artist: self.artist,
            album: self.album,
            track_number: self.track_number,
            disc_number: self.disc_number,
            year: self.year,
            duration_ms: self.duration_ms,
            isrc: self.isrc,
            ..TrackRecord::default()
        };

        match provider.as_str() {
            "spotify" => record.spotify_uri = Some(format!("spotify:track:{}", self.external_id)),
            "deezer" => record.deezer_id = Some(self.external_id),
            "musicbrainz" => record.musicbrainz_id = Some(self.external_id),
            _ => {}
        }

        record
    }
}
