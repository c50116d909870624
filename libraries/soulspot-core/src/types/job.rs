//! Background job types
//!
//! Jobs are persisted in the main database and executed by the worker pool.
//! The payload is free-form JSON interpreted by the handler registered for
//! the job's [`JobType`].

use super::ids::JobId;
use crate::error::SoulSpotError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default number of attempts before a job is marked failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Kind of background work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fetch a file through the download backend
    Download,
    /// Walk a directory and index audio files
    LibraryScan,
    /// Pull track metadata from a streaming provider
    MetadataSync,
    /// Prune old rows from the logs database
    LogRetention,
}

impl JobType {
    /// All job types, in declaration order
    pub const ALL: [JobType; 4] = [
        JobType::Download,
        JobType::LibraryScan,
        JobType::MetadataSync,
        JobType::LogRetention,
    ];

    /// Stable string form used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Download => "download",
            JobType::LibraryScan => "library_scan",
            JobType::MetadataSync => "metadata_sync",
            JobType::LogRetention => "log_retention",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = SoulSpotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(JobType::Download),
            "library_scan" => Ok(JobType::LibraryScan),
            "metadata_sync" => Ok(JobType::MetadataSync),
            "log_retention" => Ok(JobType::LogRetention),
            other => Err(SoulSpotError::invalid_input(format!(
                "Unknown job type: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Stable string form used in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the job will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SoulSpotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(SoulSpotError::invalid_input(format!(
                "Unknown job status: {}",
                other
            ))),
        }
    }
}

/// Scheduling priority; higher runs first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low = 0,
    #[default]
    Normal = 5,
    High = 10,
    Urgent = 20,
}

impl JobPriority {
    /// Numeric value stored in the database
    pub fn value(self) -> i64 {
        self as i64
    }

    /// Bucket an arbitrary stored value into a priority
    pub fn from_value(value: i64) -> Self {
        match value {
            v if v >= 20 => JobPriority::Urgent,
            v if v >= 10 => JobPriority::High,
            v if v >= 5 => JobPriority::Normal,
            _ => JobPriority::Low,
        }
    }
}

impl FromStr for JobPriority {
    type Err = SoulSpotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(JobPriority::Low),
            "normal" => Ok(JobPriority::Normal),
            "high" => Ok(JobPriority::High),
            "urgent" => Ok(JobPriority::Urgent),
            other => other
                .parse::<i64>()
                .map(JobPriority::from_value)
                .map_err(|_| SoulSpotError::invalid_input(format!("Unknown priority: {}", s))),
        }
    }
}

/// A unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    /// Number of times a worker has started this job
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job with normal priority
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::generate(),
            job_type,
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            payload,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    /// At least one attempt is always allowed
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whether another attempt is allowed after the current one fails
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
