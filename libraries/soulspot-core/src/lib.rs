//! SoulSpot Core
//!
//! Domain types, provider traits, and error handling shared by every SoulSpot crate.
//!
//! # Architecture
//!
//! The core crate defines:
//! - **Domain Types**: `Job`, `Download`, `TrackRecord`, `TrackTags`, provider DTOs
//! - **Provider Traits**: `DownloadBackend` (slskd and friends), `MetadataProvider`
//!   (Spotify, Deezer, MusicBrainz)
//! - **Error Handling**: Unified `SoulSpotError` and `Result` types
//!
//! # Example
//!
//! ```rust
//! use soulspot_core::types::{Job, JobPriority, JobType};
//!
//! let job = Job::new(JobType::LibraryScan, serde_json::json!({ "path": "/music" }))
//!     .with_priority(JobPriority::High)
//!     .with_max_attempts(5);
//!
//! assert_eq!(job.attempts, 0);
//! assert!(!job.status.is_terminal());
//! ```

#![forbid(unsafe_code)]

pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SoulSpotError};
pub use traits::{DownloadBackend, MetadataProvider};

pub use types::{
    // Ids
    DownloadId, JobId,
    // Jobs
    Job, JobPriority, JobStatus, JobType,
    // Downloads
    Download, DownloadStatus, TransferState, TransferStatus,
    // Library
    ProviderTrack, TrackRecord, TrackTags,
};
