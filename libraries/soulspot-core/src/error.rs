/// Core error types for SoulSpot
use thiserror::Error;

/// Result type alias using `SoulSpotError`
pub type Result<T> = std::result::Result<T, SoulSpotError>;

/// Core error type for SoulSpot
#[derive(Error, Debug)]
pub enum SoulSpotError {
    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// External provider (download daemon, metadata service) failed
    #[error("Provider error: {0}")]
    Provider(String),

    /// Tag reading/writing errors
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O errors
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// Database errors (for storage implementations)
    #[error("Database error: {0}")]
    Database(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl SoulSpotError {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a provider error
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a metadata error
    pub fn metadata(msg: impl Into<String>) -> Self {
        Self::Metadata(msg.into())
    }
}

#[cfg(feature = "sqlx-support")]
impl From<sqlx::Error> for SoulSpotError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_entity() {
        let err = SoulSpotError::not_found("Job", "abc");
        assert_eq!(err.to_string(), "Job not found: abc");
    }

    #[test]
    fn provider_error_display() {
        let err = SoulSpotError::provider("slskd returned 503");
        assert_eq!(err.to_string(), "Provider error: slskd returned 503");
    }
}
