/// Common test utilities and fixtures
use soulspot_daemon::SoulSpotConfig;
use soulspot_jobs::JobEvent;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Config pointing both databases into `dir` with fast timings
pub fn test_config(dir: &Path) -> SoulSpotConfig {
    let mut config = SoulSpotConfig::default();
    config.database.url = format!("sqlite://{}", dir.join("data/soulspot.db").display());
    config.database.logs_url = format!("sqlite://{}", dir.join("data/soulspot-logs.db").display());
    config.write_buffer.flush_interval_ms = 20;
    config.logging.flush_interval_ms = 20;
    config.workers.retry_delay_secs = 0;
    config.workers.max_retry_delay_secs = 0;
    config
}

/// A music directory with `count` silent wav files
pub fn music_dir(root: &TempDir, count: usize) -> PathBuf {
    let dir = root.path().join("music");
    std::fs::create_dir_all(&dir).expect("Failed to create music dir");
    for i in 0..count {
        write_silent_wav(&dir, &format!("{:02} - Track.wav", i + 1));
    }
    dir
}

pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<JobEvent>, mut pred: F) -> JobEvent
where
    F: FnMut(&JobEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
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

/// Minimal 16-bit mono PCM wav, 100ms of silence
pub fn write_silent_wav(dir: &Path, name: &str) -> PathBuf {
    let sample_rate: u32 = 8000;
    let data_len = sample_rate / 10 * 2;

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
