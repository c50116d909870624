/// Metadata-specific errors
use thiserror::Error;

/// Result type alias using `MetadataError`
pub type Result<T> = std::result::Result<T, MetadataError>;

/// Metadata error types
#[derive(Error, Debug)]
pub enum MetadataError {
    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Tag writing error
    #[error("Tag writing error: {0}")]
    WriteError(String),

    /// Directory walk error
    #[error("Cannot read directory {path}: {message}")]
    Walk { path: String, message: String },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Lofty error
    #[error(transparent)]
    Lofty(#[from] lofty::error::LoftyError),
}

impl From<MetadataError> for soulspot_core::SoulSpotError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Io(io) => soulspot_core::SoulSpotError::Io(io),
            other => soulspot_core::SoulSpotError::metadata(other.to_string()),
        }
    }
}
