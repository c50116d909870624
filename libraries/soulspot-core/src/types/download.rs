//! Download types
//!
//! A [`Download`] is the persisted record of a file requested from the
//! download backend. [`TransferState`] is what the backend reports while the
//! transfer is in flight.

use super::ids::DownloadId;
use crate::error::SoulSpotError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted download state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Queued,
    Searching,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Searching => "searching",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = SoulSpotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DownloadStatus::Queued),
            "searching" => Ok(DownloadStatus::Searching),
            "downloading" => Ok(DownloadStatus::Downloading),
            "completed" => Ok(DownloadStatus::Completed),
            "failed" => Ok(DownloadStatus::Failed),
            "cancelled" => Ok(DownloadStatus::Cancelled),
            other => Err(SoulSpotError::invalid_input(format!(
                "Unknown download status: {}",
                other
            ))),
        }
    }
}

/// A file requested from a Soulseek peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Download {
    pub id: DownloadId,
    /// Library track this download fulfils, if any
    pub track_key: Option<String>,
    /// Soulseek user sharing the file
    pub username: String,
    /// Remote path as shared by the peer
    pub filename: String,
    /// Where the finished file should end up
    pub target_path: Option<String>,
    pub status: DownloadStatus,
    pub bytes_transferred: i64,
    pub size_bytes: Option<i64>,
    /// 0.0 - 100.0
    pub progress: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Download {
    pub fn new(username: impl Into<String>, filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: DownloadId::generate(),
            track_key: None,
            username: username.into(),
            filename: filename.into(),
            target_path: None,
            status: DownloadStatus::Queued,
            bytes_transferred: 0,
            size_bytes: None,
            progress: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Transfer state as reported by a download backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Waiting in the remote peer's upload queue
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransferStatus::Succeeded | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// Snapshot of an in-flight transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub status: TransferStatus,
    pub bytes_transferred: i64,
    pub size_bytes: Option<i64>,
    /// Local path of the finished file
    pub local_path: Option<String>,
    pub error: Option<String>,
}

impl TransferState {
    /// Percentage complete, 0.0 when the size is unknown
    pub fn percent(&self) -> f64 {
        match self.size_bytes {
            Some(size) if size > 0 => {
                ((self.bytes_transferred as f64 / size as f64) * 100.0).clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }
}
