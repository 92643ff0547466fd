// MuseSync - Music Library Automation
// Copyright (C) 2026 MuseSync contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Library entities: artists, albums, tracks
//!
//! The orchestrator consults this store to validate requests, build per-track
//! candidate lists, and match completed files back to tracks. Statistics
//! columns are recomputed from filesystem reality, not incremented.

use crate::error::{MuseSyncError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::path::Path;

/// Extensions the library treats as audio content
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "flac", "mp3", "m4a", "aac", "ogg", "opus", "wav", "wma", "aiff", "ape",
];

/// Returns true when the path has a recognized audio extension
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Count audio files directly inside `dir` (non-recursive; album directories
/// are flat by library convention). Returns 0 when the directory is missing.
pub async fn count_audio_files(dir: &Path) -> usize {
    let mut count = 0;
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if is_audio_file(&entry.path()) {
            count += 1;
        }
    }
    count
}

// ============================================================================
// MODELS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artist {
    pub artist_id: i64,
    pub name: String,
    pub monitored: bool,
    pub path: Option<String>,
    pub album_count: i64,
    pub track_count: i64,
    pub track_file_count: i64,
    pub size_on_disk: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Album {
    pub album_id: i64,
    pub artist_id: i64,
    pub title: String,
    pub year: Option<i64>,
    /// Request lifecycle: `wanted` until the session import flips it to
    /// `available`
    pub request_status: String,
    pub path: Option<String>,
    pub track_count: i64,
    pub track_file_count: i64,
    pub size_on_disk: i64,
    pub created_at: DateTime<Utc>,
}

impl Album {
    /// Every known track has a file on record
    pub fn is_complete(&self) -> bool {
        self.track_count > 0 && self.track_file_count >= self.track_count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Track {
    pub track_id: i64,
    pub album_id: i64,
    pub artist_id: i64,
    pub title: String,
    pub position: i64,
    pub has_file: bool,
    pub file_path: Option<String>,
}

// ============================================================================
// STORE
// ============================================================================

/// Repository over the Artists/Albums/Tracks tables
#[derive(Debug, Clone)]
pub struct LibraryStore {
    pool: SqlitePool,
}

impl LibraryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ----- artists -----

    pub async fn insert_artist(&self, name: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO Artists (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_artist(&self, artist_id: i64) -> Result<Option<Artist>> {
        let artist = sqlx::query_as::<_, Artist>("SELECT * FROM Artists WHERE artist_id = ?")
            .bind(artist_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(artist)
    }

    /// Get an artist, failing with RecordNotFound when missing
    pub async fn require_artist(&self, artist_id: i64) -> Result<Artist> {
        self.get_artist(artist_id)
            .await?
            .ok_or_else(|| MuseSyncError::not_found(format!("Artist: {}", artist_id)))
    }

    // ----- albums -----

    pub async fn insert_album(&self, artist_id: i64, title: &str, year: Option<i64>) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO Albums (artist_id, title, year, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(artist_id)
        .bind(title)
        .bind(year)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_album(&self, album_id: i64) -> Result<Option<Album>> {
        let album = sqlx::query_as::<_, Album>("SELECT * FROM Albums WHERE album_id = ?")
            .bind(album_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(album)
    }

    pub async fn require_album(&self, album_id: i64) -> Result<Album> {
        self.get_album(album_id)
            .await?
            .ok_or_else(|| MuseSyncError::not_found(format!("Album: {}", album_id)))
    }

    pub async fn set_album_path(&self, album_id: i64, path: &Path) -> Result<()> {
        sqlx::query("UPDATE Albums SET path = ? WHERE album_id = ?")
            .bind(path.to_string_lossy().into_owned())
            .bind(album_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Flip the album request lifecycle (e.g. to `available` after import)
    pub async fn set_album_request_status(&self, album_id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE Albums SET request_status = ? WHERE album_id = ?")
            .bind(status)
            .bind(album_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ----- tracks -----

    pub async fn insert_track(
        &self,
        album_id: i64,
        artist_id: i64,
        title: &str,
        position: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO Tracks (album_id, artist_id, title, position) VALUES (?, ?, ?, ?)",
        )
        .bind(album_id)
        .bind(artist_id)
        .bind(title)
        .bind(position)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_track(&self, track_id: i64) -> Result<Option<Track>> {
        let track = sqlx::query_as::<_, Track>("SELECT * FROM Tracks WHERE track_id = ?")
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(track)
    }

    pub async fn list_album_tracks(&self, album_id: i64) -> Result<Vec<Track>> {
        let tracks =
            sqlx::query_as::<_, Track>("SELECT * FROM Tracks WHERE album_id = ? ORDER BY position")
                .bind(album_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(tracks)
    }

    /// Record that a track's file landed at `path`
    pub async fn set_track_file(&self, track_id: i64, path: &Path) -> Result<()> {
        sqlx::query("UPDATE Tracks SET has_file = 1, file_path = ? WHERE track_id = ?")
            .bind(path.to_string_lossy().into_owned())
            .bind(track_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ----- statistics -----

    /// Recompute an album's statistics from filesystem reality: a track only
    /// counts as having a file when that file still exists on disk.
    pub async fn update_album_statistics(&self, album_id: i64) -> Result<()> {
        let tracks = self.list_album_tracks(album_id).await?;

        let mut file_count: i64 = 0;
        let mut size_on_disk: i64 = 0;
        for track in &tracks {
            let Some(ref file_path) = track.file_path else {
                continue;
            };
            match tokio::fs::metadata(file_path).await {
                Ok(meta) => {
                    file_count += 1;
                    size_on_disk += meta.len() as i64;
                }
                Err(_) => {
                    // file vanished; reflect reality in the row
                    sqlx::query(
                        "UPDATE Tracks SET has_file = 0, file_path = NULL WHERE track_id = ?",
                    )
                    .bind(track.track_id)
                    .execute(&self.pool)
                    .await?;
                }
            }
        }

        sqlx::query(
            r#"
            UPDATE Albums SET track_count = ?, track_file_count = ?, size_on_disk = ?
            WHERE album_id = ?
            "#,
        )
        .bind(tracks.len() as i64)
        .bind(file_count)
        .bind(size_on_disk)
        .bind(album_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Roll album statistics up to the artist
    pub async fn update_artist_statistics(&self, artist_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE Artists SET
                album_count = (SELECT COUNT(*) FROM Albums WHERE artist_id = ?),
                track_count = (SELECT COALESCE(SUM(track_count), 0) FROM Albums WHERE artist_id = ?),
                track_file_count = (SELECT COALESCE(SUM(track_file_count), 0) FROM Albums WHERE artist_id = ?),
                size_on_disk = (SELECT COALESCE(SUM(size_on_disk), 0) FROM Albums WHERE artist_id = ?)
            WHERE artist_id = ?
            "#,
        )
        .bind(artist_id)
        .bind(artist_id)
        .bind(artist_id)
        .bind(artist_id)
        .bind(artist_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
