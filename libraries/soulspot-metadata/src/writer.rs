/// Tag writer implementation using lofty
use crate::error::{MetadataError, Result};
use lofty::{Accessor, ItemKey, Tag, TagExt, TaggedFileExt};
use soulspot_core::TrackTags;
use std::path::Path;
use tracing::debug;

/// Writes [`TrackTags`] into an audio file's primary tag
#[derive(Debug, Clone, Copy, Default)]
pub struct TagWriter;

impl TagWriter {
    pub fn new() -> Self {
        Self
    }

    /// Write every set field of `tags`; unset fields keep their current value
    ///
    /// A primary tag is created when the file has none.
    pub fn write(&self, path: &Path, tags: &TrackTags) -> Result<()> {
        if !path.exists() {
            return Err(MetadataError::FileNotFound(path.display().to_string()));
        }
        if tags.is_empty() {
            return Ok(());
        }

        let mut tagged_file = lofty::read_from_path(path)?;

        if tagged_file.primary_tag().is_none() {
            let tag_type = tagged_file.primary_tag_type();
            tagged_file.insert_tag(Tag::new(tag_type));
        }

        let tag = tagged_file.primary_tag_mut().ok_or_else(|| {
            MetadataError::UnsupportedFormat(format!(
                "{}: cannot create a tag",
                path.display()
            ))
        })?;

        Self::apply(tag, tags);

        tag.save_to_path(path)
            .map_err(|e| MetadataError::WriteError(format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "Wrote tags");
        Ok(())
    }

    fn apply(tag: &mut Tag, tags: &TrackTags) {
        if let Some(title) = &tags.title {
            tag.set_title(title.clone());
        }
        if let Some(artist) = &tags.artist {
            tag.set_artist(artist.clone());
        }
        if let Some(album) = &tags.album {
            tag.set_album(album.clone());
        }
        if let Some(album_artist) = &tags.album_artist {
            tag.insert_text(ItemKey::AlbumArtist, album_artist.clone());
        }
        if let Some(genre) = &tags.genre {
            tag.set_genre(genre.clone());
        }
        if let Some(year) = tags.year {
            tag.set_year(year);
        }
        if let Some(track) = tags.track_number {
            tag.set_track(track);
        }
        if let Some(disc) = tags.disc_number {
            tag.set_disk(disc);
        }
    }
}
