/// Tag reader implementation using lofty
use crate::error::{MetadataError, Result};
use lofty::{Accessor, AudioFile, ItemKey, TaggedFileExt};
use soulspot_core::TrackTags;
use std::path::Path;

/// Metadata reader using the lofty library
#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyMetadataReader;

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

impl LoftyMetadataReader {
    /// Create a new metadata reader
    pub fn new() -> Self {
        Self
    }

    /// Extract tag values from a lofty tag
    fn extract_from_tag(tag: &lofty::Tag) -> TrackTags {
        let mut tags = TrackTags::new();

        tags.title = tag.title().as_deref().and_then(non_empty);
        tags.artist = tag.artist().as_deref().and_then(non_empty);
        tags.album = tag.album().as_deref().and_then(non_empty);
        tags.genre = tag.genre().as_deref().and_then(non_empty);
        tags.album_artist = tag.get_string(&ItemKey::AlbumArtist).and_then(non_empty);

        // Accessors understand "3/12" track numbers and full release dates
        tags.track_number = tag.track();
        tags.disc_number = tag.disk();
        tags.year = tag.year().or_else(|| {
            tag.get_string(&ItemKey::RecordingDate)
                .and_then(|date| date.get(..4))
                .and_then(|year| year.parse().ok())
        });

        tags
    }

    /// Read tags and duration from an audio file
    ///
    /// Files without any tag still yield their duration.
    pub fn read(&self, path: &Path) -> Result<TrackTags> {
        if !path.exists() {
            return Err(MetadataError::FileNotFound(path.display().to_string()));
        }

        let tagged_file = lofty::read_from_path(path)?;

        let duration = tagged_file.properties().duration();
        let duration_ms = (!duration.is_zero()).then(|| duration.as_millis() as u64);

        // Get primary tag or first tag (if available)
        let mut tags = tagged_file
            .primary_tag()
            .or_else(|| tagged_file.tags().first())
            .map(Self::extract_from_tag)
            .unwrap_or_default();
        tags.duration_ms = duration_ms;

        Ok(tags)
    }
}
