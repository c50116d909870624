/// Storage-specific errors
use thiserror::Error;

/// Result type alias using `StorageError`
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection error: {0}")]
    Connection(String),

    /// Query execution error
    #[error("Query error: {0}")]
    Query(String),

    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The database stayed locked for every retry attempt
    #[error("Database locked: {operation} gave up after {attempts} attempts")]
    LockTimeout { operation: String, attempts: u32 },

    /// Database error from `SQLx`
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Whether this error is transient SQLite lock contention worth retrying
    pub fn is_lock_error(&self) -> bool {
        match self {
            StorageError::Database(err) => crate::retry::is_lock_error(err),
            _ => false,
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::Migration(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

impl From<soulspot_core::SoulSpotError> for StorageError {
    fn from(err: soulspot_core::SoulSpotError) -> Self {
        match err {
            soulspot_core::SoulSpotError::NotFound { entity, id } => {
                StorageError::NotFound { entity, id }
            }
            other => StorageError::Query(other.to_string()),
        }
    }
}

impl From<StorageError> for soulspot_core::SoulSpotError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { entity, id } => {
                soulspot_core::SoulSpotError::NotFound { entity, id }
            }
            other => soulspot_core::SoulSpotError::storage(other.to_string()),
        }
    }
}
