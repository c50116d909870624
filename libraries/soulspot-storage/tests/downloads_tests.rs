//! Integration tests for downloads vertical slice


use soulspot_core::{DownloadId, DownloadStatus};
use soulspot_storage::downloads::{self, DownloadProgressUpdate};
use soulspot_storage::{StorageError, WriteBuffer, WriteBufferConfig};
use test_helpers::*;

fn progress_buffer(test_db: &TestDb) -> WriteBuffer<DownloadProgressUpdate> {
    WriteBuffer::new(
        "downloads",
        test_db.pool().clone(),
        test_db.db().retry().clone(),
        WriteBufferConfig::default(),
    )
}

#[tokio::test]
async fn test_create_and_get_download() {
    let test_db = TestDb::new().await;
    let mut download = soulspot_core::Download::new("peer", "Music\\Artist\\01.flac");
    download.track_key = Some("spotify:abc".to_string());
    download.target_path = Some("/downloads/01.flac".to_string());
    downloads::create(test_db.db(), &download).await.unwrap();

    let stored = downloads::get(test_db.db(), &download.id)
        .await
        .unwrap()
        .expect("Download should exist");

    assert_eq!(stored.id, download.id);
    assert_eq!(stored.username, "peer");
    assert_eq!(stored.filename, "Music\\Artist\\01.flac");
    assert_eq!(stored.track_key.as_deref(), Some("spotify:abc"));
    assert_eq!(stored.status, DownloadStatus::Queued);
    assert_eq!(
        stored.created_at.timestamp_millis(),
        download.created_at.timestamp_millis()
    );
}

#[tokio::test]
async fn test_update_status_and_list_active() {
    let test_db = TestDb::new().await;
    let first = create_test_download(test_db.db(), "a.mp3").await;
    let second = create_test_download(test_db.db(), "b.mp3").await;

    downloads::update_status(test_db.db(), &first.id, DownloadStatus::Completed, None)
        .await
        .unwrap();
    downloads::update_status(
        test_db.db(),
        &second.id,
        DownloadStatus::Downloading,
        None,
    )
    .await
    .unwrap();

    let active = downloads::list_active(test_db.db()).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, second.id);

    let done = downloads::get(test_db.db(), &first.id).await.unwrap().unwrap();
    assert_eq!(done.status, DownloadStatus::Completed);
    assert_eq!(done.progress, 100.0);
}

#[tokio::test]
async fn test_update_status_of_unknown_download() {
    let test_db = TestDb::new().await;

    let err = downloads::update_status(
        test_db.db(),
        &DownloadId::new("missing"),
        DownloadStatus::Failed,
        Some("boom"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StorageError::NotFound { .. }));
}

#[tokio::test]
async fn test_progress_updates_coalesce_to_latest() {
    let test_db = TestDb::new().await;
    let download = create_test_download(test_db.db(), "c.flac").await;
    let buffer = progress_buffer(&test_db);

    for bytes in [100, 500, 900] {
        buffer
            .push(DownloadProgressUpdate {
                bytes_transferred: bytes,
                size_bytes: Some(1000),
                progress: bytes as f64 / 10.0,
                ..DownloadProgressUpdate::new(download.id.clone(), DownloadStatus::Downloading)
            })
            .await;
    }

    assert_eq!(buffer.pending_len().await, 1);
    assert_eq!(buffer.flush().await.unwrap(), 1);

    let stored = downloads::get(test_db.db(), &download.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, DownloadStatus::Downloading);
    assert_eq!(stored.bytes_transferred, 900);
    assert_eq!(stored.size_bytes, Some(1000));
    assert_eq!(stored.progress, 90.0);
}

#[tokio::test]
async fn test_late_progress_does_not_reopen_finished_download() {
    let test_db = TestDb::new().await;
    let download = create_test_download(test_db.db(), "d.flac").await;
    let buffer = progress_buffer(&test_db);

    buffer
        .push(DownloadProgressUpdate::new(
            download.id.clone(),
            DownloadStatus::Downloading,
        ))
        .await;
    downloads::update_status(test_db.db(), &download.id, DownloadStatus::Cancelled, None)
        .await
        .unwrap();
    buffer.flush().await.unwrap();

    let stored = downloads::get(test_db.db(), &download.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, DownloadStatus::Cancelled);
}
