//! Library track types

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Track row as stored in the library database
///
/// `track_key` is the natural key used to coalesce writes: `file:<path>` for
/// tracks found on disk and `<provider>:<external id>` for tracks pulled from
/// a streaming provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub track_key: String,
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<u32>,
    pub genre: Option<String>,
    pub duration_ms: Option<u64>,
    pub file_path: Option<String>,
    pub spotify_uri: Option<String>,
    pub deezer_id: Option<String>,
    pub musicbrainz_id: Option<String>,
    pub isrc: Option<String>,
}

impl TrackRecord {
    /// Key for a track discovered on disk
    pub fn file_key(path: &Path) -> String {
        format!("file:{}", path.display())
    }

    /// Key for a track known to a streaming provider
    pub fn provider_key(provider: &str, external_id: &str) -> String {
        format!("{}:{}", provider.to_ascii_lowercase(), external_id)
    }

    /// Build a record from tags read off a file
    ///
    /// Files without a title tag fall back to the file stem.
    pub fn from_tags(path: &Path, tags: TrackTags) -> Self {
        let title = tags
            .title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "Unknown".to_string());

        Self {
            track_key: Self::file_key(path),
            title,
            artist: tags.artist,
            album: tags.album,
            album_artist: tags.album_artist,
            track_number: tags.track_number,
            disc_number: tags.disc_number,
            year: tags.year,
            genre: tags.genre,
            duration_ms: tags.duration_ms,
            file_path: Some(path.to_string_lossy().into_owned()),
            ..Self::default()
        }
    }
}

/// Tag values read from or written to an audio file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    /// Only meaningful when reading
    pub duration_ms: Option<u64>,
}

impl TrackTags {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no writable field is set
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.album_artist.is_none()
            && self.genre.is_none()
            && self.year.is_none()
            && self.track_number.is_none()
            && self.disc_number.is_none()
    }
}
