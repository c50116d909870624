//! Download records
//!
//! Rows are created when a download is requested and then updated by the
//! download handler. Progress reports arrive every poll interval, so they go
//! through a [`WriteBuffer`](crate::WriteBuffer) of [`DownloadProgressUpdate`]s
//! instead of hitting the database directly.

use crate::write_buffer::BufferedRecord;
use crate::{from_millis, now_millis, Database, Result, StorageError};
use async_trait::async_trait;
use soulspot_core::{Download, DownloadId, DownloadStatus};
use sqlx::{FromRow, SqliteConnection};

#[derive(FromRow)]
struct DownloadRow {
    id: String,
    track_key: Option<String>,
    username: String,
    filename: String,
    target_path: Option<String>,
    status: String,
    bytes_transferred: i64,
    size_bytes: Option<i64>,
    progress: f64,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<DownloadRow> for Download {
    type Error = StorageError;

    fn try_from(row: DownloadRow) -> Result<Self> {
        Ok(Download {
            id: DownloadId::new(row.id),
            track_key: row.track_key,
            username: row.username,
            filename: row.filename,
            target_path: row.target_path,
            status: row.status.parse()?,
            bytes_transferred: row.bytes_transferred,
            size_bytes: row.size_bytes,
            progress: row.progress,
            error: row.error,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

const SELECT_DOWNLOAD: &str = r#"
    SELECT id, track_key, username, filename, target_path, status,
           bytes_transferred, size_bytes, progress, error, created_at, updated_at
    FROM downloads
"#;

/// Persist a new download
pub async fn create(db: &Database, download: &Download) -> Result<()> {
    let pool = db.pool();

    db.retry()
        .run("downloads.create", || async move {
            sqlx::query(
                r#"
                INSERT INTO downloads (
                    id, track_key, username, filename, target_path, status,
                    bytes_transferred, size_bytes, progress, error, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&download.id)
            .bind(&download.track_key)
            .bind(&download.username)
            .bind(&download.filename)
            .bind(&download.target_path)
            .bind(download.status.as_str())
            .bind(download.bytes_transferred)
            .bind(download.size_bytes)
            .bind(download.progress)
            .bind(&download.error)
            .bind(download.created_at.timestamp_millis())
            .bind(download.updated_at.timestamp_millis())
            .execute(pool)
            .await?;
            Ok::<_, StorageError>(())
        })
        .await
}

/// Get a download by ID
pub async fn get(db: &Database, id: &DownloadId) -> Result<Option<Download>> {
    let row: Option<DownloadRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_DOWNLOAD))
        .bind(id)
        .fetch_optional(db.pool())
        .await?;

    row.map(Download::try_from).transpose()
}

/// Downloads that have not reached a terminal state, oldest first
pub async fn list_active(db: &Database) -> Result<Vec<Download>> {
    let rows: Vec<DownloadRow> = sqlx::query_as(&format!(
        "{} WHERE status IN ('queued', 'searching', 'downloading') ORDER BY created_at",
        SELECT_DOWNLOAD
    ))
    .fetch_all(db.pool())
    .await?;

    rows.into_iter().map(Download::try_from).collect()
}

/// Set the status (and error) of a download immediately, bypassing buffering
///
/// Used for state transitions that must be visible at once, such as a
/// download finishing or being cancelled.
pub async fn update_status(
    db: &Database,
    id: &DownloadId,
    status: DownloadStatus,
    error: Option<&str>,
) -> Result<()> {
    let pool = db.pool();

    let result = db
        .retry()
        .run("downloads.update_status", || async move {
            let result = sqlx::query(
                r#"
                UPDATE downloads
                SET status = ?1, error = ?2, updated_at = ?3,
                    progress = CASE WHEN ?1 = 'completed' THEN 100.0 ELSE progress END
                WHERE id = ?4
                "#,
            )
            .bind(status.as_str())
            .bind(error)
            .bind(now_millis())
            .bind(id)
            .execute(pool)
            .await?;
            Ok::<_, StorageError>(result.rows_affected())
        })
        .await?;

    if result == 0 {
        return Err(StorageError::not_found("download", id.as_str()));
    }
    Ok(())
}

/// Buffered progress report for a download
///
/// A newer report for the same download replaces the pending one.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadProgressUpdate {
    pub id: DownloadId,
    pub status: DownloadStatus,
    pub bytes_transferred: i64,
    pub size_bytes: Option<i64>,
    pub progress: f64,
    pub error: Option<String>,
}

impl DownloadProgressUpdate {
    pub fn new(id: DownloadId, status: DownloadStatus) -> Self {
        Self {
            id,
            status,
            bytes_transferred: 0,
            size_bytes: None,
            progress: 0.0,
            error: None,
        }
    }
}

#[async_trait]
impl BufferedRecord for DownloadProgressUpdate {
    type Key = DownloadId;

    fn key(&self) -> DownloadId {
        self.id.clone()
    }

    async fn write_batch(
        conn: &mut SqliteConnection,
        records: &[Self],
    ) -> std::result::Result<(), sqlx::Error> {
        let now = now_millis();

        for update in records {
            // Never move a download out of a terminal state
            sqlx::query(
                r#"
                UPDATE downloads
                SET status = ?, bytes_transferred = ?,
                    size_bytes = COALESCE(?, size_bytes),
                    progress = ?, error = COALESCE(?, error), updated_at = ?
                WHERE id = ?
                  AND status NOT IN ('completed', 'failed', 'cancelled')
                "#,
            )
            .bind(update.status.as_str())
            .bind(update.bytes_transferred)
            .bind(update.size_bytes)
            .bind(update.progress)
            .bind(&update.error)
            .bind(now)
            .bind(&update.id)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }
}
