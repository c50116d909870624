//! SoulSpot Metadata
//!
//! Tag reading and writing for audio files, and discovery of audio files in
//! a library directory.
//!
//! This crate provides:
//! - Tag reading from audio files (MP3, FLAC, OGG, WAV, AAC, OPUS)
//! - Tag writing into the file's primary tag
//! - Recursive audio file discovery with an extension filter
//!
//! Everything here is blocking file I/O. Async callers should run it on
//! `tokio::task::spawn_blocking`.
//!
//! # Example
//!
//! ```rust,no_run
//! use soulspot_metadata::{discover_audio_files, LoftyMetadataReader, DEFAULT_EXTENSIONS};
//! use std::path::Path;
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let reader = LoftyMetadataReader::new();
//!
//! for path in discover_audio_files(Path::new("/music"), DEFAULT_EXTENSIONS)? {
//!     let tags = reader.read(&path)?;
//!     println!("{}: {:?}", path.display(), tags.title);
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod reader;
mod scanner;
mod writer;

pub use error::{MetadataError, Result};
pub use reader::LoftyMetadataReader;
pub use scanner::{discover_audio_files, is_supported_file, DEFAULT_EXTENSIONS};
pub use writer::TagWriter;
