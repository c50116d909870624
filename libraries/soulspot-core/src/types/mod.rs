mod download;
mod ids;
mod job;
mod provider;
mod track;

pub use download::{Download, DownloadStatus, TransferState, TransferStatus};
pub use ids::{DownloadId, JobId};
pub use job::{Job, JobPriority, JobStatus, JobType, DEFAULT_MAX_ATTEMPTS};
pub use provider::ProviderTrack;
pub use track::{TrackRecord, TrackTags};
