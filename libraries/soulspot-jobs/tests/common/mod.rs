//! Shared fixtures for job integration tests
//!
//! Databases are real SQLite files in a temp dir. Providers and download
//! backends are scripted fakes.

#![allow(dead_code)]

use async_trait::async_trait;
use soulspot_core::{
    DownloadBackend, MetadataProvider, ProviderTrack, SoulSpotError, TransferState,
    TransferStatus,
};
use soulspot_jobs::{JobEvent, WorkerPoolConfig};
use soulspot_storage::logs::LogStore;
use soulspot_storage::tracks::TrackUpsert;
use soulspot_storage::{
    Database, PoolSettings, RetryConfig, WriteBuffer, WriteBufferConfig,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

/// Pool settings for tests: one worker unless stated, tiny retry backoff
pub fn pool_config(workers: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        workers,
        queue_capacity: 100,
        retry_backoff: RetryConfig {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            multiplier: 1.0,
            jitter: 0.0,
        },
        job_timeout: None,
        cancel_grace: Duration::from_millis(200),
    }
}

/// Library and logs databases in one temp dir
pub struct TestEnv {
    pub db: Database,
    pub logs: LogStore,
    pub dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let url = format!("sqlite://{}", dir.path().join("soulspot.db").display());
        let logs_url = format!("sqlite://{}", dir.path().join("logs.db").display());

        let db = Database::connect(&url, &PoolSettings::default(), fast_retry())
            .await
            .expect("Failed to open database");
        let logs = LogStore::open(&logs_url, &PoolSettings::default(), fast_retry())
            .await
            .expect("Failed to open logs database");

        Self { db, logs, dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn buffer<R: soulspot_storage::BufferedRecord>(&self, name: &str) -> WriteBuffer<R> {
        WriteBuffer::new(
            name,
            self.db.pool().clone(),
            self.db.retry().clone(),
            WriteBufferConfig::default(),
        )
    }

    pub fn tracks(&self) -> WriteBuffer<TrackUpsert> {
        self.buffer("tracks")
    }
}

/// Wait for the first event matching `pred`, failing after five seconds
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<JobEvent>, mut pred: F) -> JobEvent
where
    F: FnMut(&JobEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for job event")
}

/// Download backend replaying a scripted sequence of transfer states
///
/// Once the script is exhausted the last state repeats.
pub struct FakeBackend {
    script: Mutex<VecDeque<TransferState>>,
    last: Mutex<Option<TransferState>>,
    start_error: Mutex<Option<String>>,
    pub started: AtomicUsize,
    pub cancelled: AtomicUsize,
}

impl FakeBackend {
    pub fn new(script: Vec<TransferState>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            start_error: Mutex::new(None),
            started: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn failing_start(message: &str) -> Self {
        let backend = Self::new(Vec::new());
        *backend.start_error.lock().unwrap() = Some(message.to_string());
        backend
    }
}

pub fn transfer(status: TransferStatus, bytes: i64, size: i64) -> TransferState {
    TransferState {
        status,
        bytes_transferred: bytes,
        size_bytes: Some(size),
        local_path: None,
        error: None,
    }
}

#[async_trait]
impl DownloadBackend for FakeBackend {
    async fn start(&self, _username: &str, _filename: &str) -> soulspot_core::Result<String> {
        if let Some(message) = self.start_error.lock().unwrap().clone() {
            return Err(SoulSpotError::provider(message));
        }
        let n = self.started.fetch_add(1, Ordering::SeqCst);
        Ok(format!("transfer-{}", n))
    }

    async fn status(&self, _transfer_id: &str) -> soulspot_core::Result<TransferState> {
        let next = self.script.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(state) = next {
            *last = Some(state);
        }
        last.clone()
            .ok_or_else(|| SoulSpotError::provider("no transfer state scripted"))
    }

    async fn cancel(&self, _transfer_id: &str) -> soulspot_core::Result<()> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Metadata provider returning fixed tracks for any artist
pub struct FakeProvider {
    pub name: String,
    pub tracks: Vec<ProviderTrack>,
}

impl FakeProvider {
    pub fn new(name: &str, titles: &[&str]) -> Self {
        let tracks = titles
            .iter()
            .enumerate()
            .map(|(i, title)| ProviderTrack {
                provider: name.to_string(),
                external_id: format!("id{}", i),
                title: (*title).to_string(),
                artist: Some("Artist".to_string()),
                track_number: Some(i as u32 + 1),
                ..ProviderTrack::default()
            })
            .collect();
        Self {
            name: name.to_string(),
            tracks,
        }
    }
}

#[async_trait]
impl MetadataProvider for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn artist_tracks(
        &self,
        external_artist_id: &str,
    ) -> soulspot_core::Result<Vec<ProviderTrack>> {
        if external_artist_id == "missing" {
            return Err(SoulSpotError::provider("artist not found upstream"));
        }
        Ok(self.tracks.clone())
    }
}

/// Write a silent 16-bit mono PCM WAV file of `millis` length
pub fn write_silent_wav(dir: &Path, name: &str, millis: u32) -> PathBuf {
    let sample_rate: u32 = 8000;
    let samples = sample_rate * millis / 1000;
    let data_len = samples * 2;

    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");

    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
    bytes.extend_from_slice(&1u16.to_le_bytes()); // mono
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());

    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    bytes.resize(bytes.len() + data_len as usize, 0);

    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("Failed to write wav fixture");
    path
}
