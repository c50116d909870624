/// Audio file discovery
use crate::error::{MetadataError, Result};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Supported audio file extensions
pub const DEFAULT_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "opus", "wav", "m4a", "aac"];

/// Check if a file has one of `extensions` (case-insensitive)
pub fn is_supported_file<S: AsRef<str>>(path: &Path, extensions: &[S]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|allowed| allowed.as_ref().eq_ignore_ascii_case(ext))
        })
}

/// Discover audio files under `root` recursively, sorted by path
///
/// `root` may also be a single file. Unreadable entries below the root are
/// skipped with a warning.
pub fn discover_audio_files<S: AsRef<str>>(root: &Path, extensions: &[S]) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(MetadataError::FileNotFound(root.display().to_string()));
    }

    if root.is_file() {
        return Ok(if is_supported_file(root, extensions) {
            vec![root.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(MetadataError::Walk {
                    path: root.display().to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(error = %e, "Skipping unreadable library entry");
                continue;
            }
        };

        if entry.file_type().is_file() && is_supported_file(entry.path(), extensions) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}
