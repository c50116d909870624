//! Provider traits
//!
//! Concrete clients (slskd, Spotify, Deezer, MusicBrainz) live outside this
//! workspace and plug into the job handlers through these traits.

use crate::error::Result;
use crate::types::{ProviderTrack, TransferState};
use async_trait::async_trait;

/// A backend that fetches files from the Soulseek network
///
/// Implementations wrap a daemon such as slskd. Transfers are identified by
/// an opaque id returned from [`DownloadBackend::start`].
#[async_trait]
pub trait DownloadBackend: Send + Sync {
    /// Request `filename` from `username`; returns the transfer id
    async fn start(&self, username: &str, filename: &str) -> Result<String>;

    /// Current state of a transfer
    async fn status(&self, transfer_id: &str) -> Result<TransferState>;

    /// Abort a transfer; cancelling a finished transfer is not an error
    async fn cancel(&self, transfer_id: &str) -> Result<()>;
}

/// A streaming/metadata service that can list an artist's tracks
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Lowercase provider name, used in track keys
    fn name(&self) -> &str;

    /// All tracks the provider knows for an artist
    async fn artist_tracks(&self, external_artist_id: &str) -> Result<Vec<ProviderTrack>>;
}
