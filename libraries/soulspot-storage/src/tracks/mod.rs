//! Library tracks
//!
//! Writes are never issued one row at a time. Scans and provider syncs push
//! [`TrackUpsert`]s into a [`WriteBuffer`](crate::WriteBuffer), which upserts
//! them by `track_key` in batches.

use crate::write_buffer::BufferedRecord;
use crate::{Database, Result};
use async_trait::async_trait;
use soulspot_core::TrackRecord;
use sqlx::{FromRow, SqliteConnection};

/// Buffered insert-or-update of a library track
///
/// Fields left empty by a newer write keep the value of the earlier one, both
/// while pending and against the stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackUpsert(pub TrackRecord);

impl From<TrackRecord> for TrackUpsert {
    fn from(record: TrackRecord) -> Self {
        Self(record)
    }
}

fn keep<T>(older: &mut Option<T>, newer: Option<T>) {
    if newer.is_some() {
        *older = newer;
    }
}

#[async_trait]
impl BufferedRecord for TrackUpsert {
    type Key = String;

    fn key(&self) -> String {
        self.0.track_key.clone()
    }

    fn merge(&mut self, newer: Self) {
        let old = &mut self.0;
        let new = newer.0;

        if !new.title.trim().is_empty() {
            old.title = new.title;
        }
        keep(&mut old.artist, new.artist);
        keep(&mut old.album, new.album);
        keep(&mut old.album_artist, new.album_artist);
        keep(&mut old.track_number, new.track_number);
        keep(&mut old.disc_number, new.disc_number);
        keep(&mut old.year, new.year);
        keep(&mut old.genre, new.genre);
        keep(&mut old.duration_ms, new.duration_ms);
        keep(&mut old.file_path, new.file_path);
        keep(&mut old.spotify_uri, new.spotify_uri);
        keep(&mut old.deezer_id, new.deezer_id);
        keep(&mut old.musicbrainz_id, new.musicbrainz_id);
        keep(&mut old.isrc, new.isrc);
    }

    async fn write_batch(
        conn: &mut SqliteConnection,
        records: &[Self],
    ) -> std::result::Result<(), sqlx::Error> {
        let now = crate::now_millis();

        for TrackUpsert(track) in records {
            sqlx::query(
                r#"
                INSERT INTO tracks (
                    track_key, title, artist, album, album_artist,
                    track_number, disc_number, year, genre, duration_ms,
                    file_path, spotify_uri, deezer_id, musicbrainz_id, isrc,
                    created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(track_key) DO UPDATE SET
                    title = excluded.title,
                    artist = COALESCE(excluded.artist, tracks.artist),
                    album = COALESCE(excluded.album, tracks.album),
                    album_artist = COALESCE(excluded.album_artist, tracks.album_artist),
                    track_number = COALESCE(excluded.track_number, tracks.track_number),
                    disc_number = COALESCE(excluded.disc_number, tracks.disc_number),
                    year = COALESCE(excluded.year, tracks.year),
                    genre = COALESCE(excluded.genre, tracks.genre),
                    duration_ms = COALESCE(excluded.duration_ms, tracks.duration_ms),
                    file_path = COALESCE(excluded.file_path, tracks.file_path),
                    spotify_uri = COALESCE(excluded.spotify_uri, tracks.spotify_uri),
                    deezer_id = COALESCE(excluded.deezer_id, tracks.deezer_id),
                    musicbrainz_id = COALESCE(excluded.musicbrainz_id, tracks.musicbrainz_id),
                    isrc = COALESCE(excluded.isrc, tracks.isrc),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&track.track_key)
            .bind(&track.title)
            .bind(&track.artist)
            .bind(&track.album)
            .bind(&track.album_artist)
            .bind(track.track_number.map(i64::from))
            .bind(track.disc_number.map(i64::from))
            .bind(track.year.map(i64::from))
            .bind(&track.genre)
            .bind(track.duration_ms.map(|ms| ms as i64))
            .bind(&track.file_path)
            .bind(&track.spotify_uri)
            .bind(&track.deezer_id)
            .bind(&track.musicbrainz_id)
            .bind(&track.isrc)
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }
}

#[derive(FromRow)]
struct TrackRow {
    track_key: String,
    title: String,
    artist: Option<String>,
    album: Option<String>,
    album_artist: Option<String>,
    track_number: Option<i64>,
    disc_number: Option<i64>,
    year: Option<i64>,
    genre: Option<String>,
    duration_ms: Option<i64>,
    file_path: Option<String>,
    spotify_uri: Option<String>,
    deezer_id: Option<String>,
    musicbrainz_id: Option<String>,
    isrc: Option<String>,
}

impl From<TrackRow> for TrackRecord {
    fn from(row: TrackRow) -> Self {
        TrackRecord {
            track_key: row.track_key,
            title: row.title,
            artist: row.artist,
            album: row.album,
            album_artist: row.album_artist,
            track_number: row.track_number.and_then(|n| u32::try_from(n).ok()),
            disc_number: row.disc_number.and_then(|n| u32::try_from(n).ok()),
            year: row.year.and_then(|n| u32::try_from(n).ok()),
            genre: row.genre,
            duration_ms: row.duration_ms.and_then(|n| u64::try_from(n).ok()),
            file_path: row.file_path,
            spotify_uri: row.spotify_uri,
            deezer_id: row.deezer_id,
            musicbrainz_id: row.musicbrainz_id,
            isrc: row.isrc,
        }
    }
}

const SELECT_TRACK: &str = r#"
    SELECT track_key, title, artist, album, album_artist,
           track_number, disc_number, year, genre, duration_ms,
           file_path, spotify_uri, deezer_id, musicbrainz_id, isrc
    FROM tracks
"#;

/// Get a stored track by its natural key
pub async fn get_by_key(db: &Database, track_key: &str) -> Result<Option<TrackRecord>> {
    let row: Option<TrackRow> = sqlx::query_as(&format!("{} WHERE track_key = ?", SELECT_TRACK))
        .bind(track_key)
        .fetch_optional(db.pool())
        .await?;

    Ok(row.map(TrackRecord::from))
}

/// Number of stored tracks
pub async fn count(db: &Database) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracks")
        .fetch_one(db.pool())
        .await?;
    Ok(count)
}

/// Tracks ordered by artist, album, disc and track number
pub async fn list(db: &Database, limit: i64, offset: i64) -> Result<Vec<TrackRecord>> {
    let rows: Vec<TrackRow> = sqlx::query_as(&format!(
        "{} ORDER BY artist, album, disc_number, track_number, title LIMIT ? OFFSET ?",
        SELECT_TRACK
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(db.pool())
    .await?;

    Ok(rows.into_iter().map(TrackRecord::from).collect())
}

/// Search tracks by query (searches title, artist and album)
pub async fn search(db: &Database, query: &str) -> Result<Vec<TrackRecord>> {
    let search_pattern = format!("%{}%", query);

    let rows: Vec<TrackRow> = sqlx::query_as(&format!(
        "{} WHERE title LIKE ? OR artist LIKE ? OR album LIKE ? ORDER BY title",
        SELECT_TRACK
    ))
    .bind(&search_pattern)
    .bind(&search_pattern)
    .bind(&search_pattern)
    .fetch_all(db.pool())
    .await?;

    Ok(rows.into_iter().map(TrackRecord::from).collect())
}
