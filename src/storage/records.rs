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


//! Download records: the central entity of the orchestration engine
//!
//! A [`DownloadRecord`] is an append-mostly audit record, created when a
//! download is queued and mutated only by the orchestrator, the recovery
//! reconciler, and the file relocator. Records are never deleted; superseded
//! records are marked stale and terminally-failed ones are left for the
//! downstream queue cleaner.
//!
//! # SQLite Adaptations
//! - `tried_usernames` and `events` stored as JSON text columns
//! - Enums stored as their canonical lowercase strings
//! - Timestamps stored as TEXT in ISO 8601 format

use crate::download::events::LoggedEvent;
use crate::error::{MuseSyncError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

// ============================================================================
// ENUMS
// ============================================================================

/// What kind of request a record tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadKind {
    #[serde(rename = "album")]
    Album,
    #[serde(rename = "track")]
    Track,
    /// Single-track, lower-priority request with deferred identity matching
    #[serde(rename = "weekly-flow")]
    WeeklyFlow,
}

impl DownloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadKind::Album => "album",
            DownloadKind::Track => "track",
            DownloadKind::WeeklyFlow => "weekly-flow",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "album" => Ok(DownloadKind::Album),
            "track" => Ok(DownloadKind::Track),
            "weekly-flow" => Ok(DownloadKind::WeeklyFlow),
            _ => Err(MuseSyncError::invalid_input(format!(
                "Invalid download kind: {}",
                s
            ))),
        }
    }
}

/// Lifecycle status of a download record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    #[serde(rename = "requested")]
    Requested,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "stalled")]
    Stalled,
    #[serde(rename = "completed")]
    Completed,
    /// Moved into the library tree and matched to a track
    #[serde(rename = "added")]
    Added,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "cancelled")]
    Cancelled,
    /// Set by the downstream queue cleaner, never by the core
    #[serde(rename = "deleted")]
    Deleted,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Requested => "requested",
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Stalled => "stalled",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Added => "added",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Timeout => "timeout",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "requested" => Ok(DownloadStatus::Requested),
            "queued" => Ok(DownloadStatus::Queued),
            "downloading" => Ok(DownloadStatus::Downloading),
            "stalled" => Ok(DownloadStatus::Stalled),
            "completed" => Ok(DownloadStatus::Completed),
            "added" => Ok(DownloadStatus::Added),
            "failed" => Ok(DownloadStatus::Failed),
            "timeout" => Ok(DownloadStatus::Timeout),
            "cancelled" => Ok(DownloadStatus::Cancelled),
            "deleted" => Ok(DownloadStatus::Deleted),
            _ => Err(MuseSyncError::invalid_input(format!(
                "Invalid download status: {}",
                s
            ))),
        }
    }

    /// Terminal states: the record will not progress on its own
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed
                | DownloadStatus::Added
                | DownloadStatus::Failed
                | DownloadStatus::Timeout
                | DownloadStatus::Cancelled
                | DownloadStatus::Deleted
        )
    }

    /// States the poll loop expects to see matched against the remote list
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Requested
                | DownloadStatus::Queued
                | DownloadStatus::Downloading
                | DownloadStatus::Stalled
        )
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// The central entity: one row per requested album session, track, or
/// weekly-flow item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Locally generated identity
    pub id: String,
    /// External service's id, absent until the service assigns one
    pub external_id: Option<String>,
    pub kind: DownloadKind,

    /// Album session this record belongs to (parent records reference
    /// themselves)
    pub session_id: Option<String>,
    /// Session-level placeholder rather than a per-track record
    pub is_parent: bool,
    /// Superseded by a newer session for the same album
    pub stale: bool,

    pub artist_id: Option<i64>,
    pub album_id: Option<i64>,
    pub track_id: Option<i64>,
    pub artist_name: Option<String>,
    pub album_name: Option<String>,
    pub track_title: Option<String>,
    pub track_position: Option<i64>,

    pub status: DownloadStatus,
    /// 0-100
    pub progress: f64,
    pub last_progress: f64,
    /// Raw status string last reported by the external service
    pub last_state: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,

    pub retry_count: i32,
    pub requeue_count: i32,
    pub stall_retries: i32,
    pub error_type: Option<String>,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_requeue_at: Option<DateTime<Utc>>,
    /// Peers already attempted, in order, to avoid re-selecting a bad source
    pub tried_usernames: Vec<String>,
    /// Set by the downstream queue cleaner once it has acted on a failure
    pub queue_cleaned: bool,

    /// Remote peer serving the file
    pub username: Option<String>,
    /// Remote-reported filename
    pub filename: Option<String>,
    /// Resolved local path before the final move; survives restarts while an
    /// album session is still assembling
    pub temp_file_path: Option<String>,
    /// Final library path after the move
    pub destination_path: Option<String>,
    /// Raw path reported by the external service's detail endpoint, if any
    pub remote_file_path: Option<String>,

    /// Append-only audit trail, newest last, capped at 100 entries
    pub events: Vec<LoggedEvent>,

    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadRecord {
    fn blank(kind: DownloadKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            external_id: None,
            kind,
            session_id: None,
            is_parent: false,
            stale: false,
            artist_id: None,
            album_id: None,
            track_id: None,
            artist_name: None,
            album_name: None,
            track_title: None,
            track_position: None,
            status: DownloadStatus::Requested,
            progress: 0.0,
            last_progress: 0.0,
            last_state: None,
            last_checked: None,
            retry_count: 0,
            requeue_count: 0,
            stall_retries: 0,
            error_type: None,
            last_error: None,
            last_failure_at: None,
            last_requeue_at: None,
            tried_usernames: Vec::new(),
            queue_cleaned: false,
            username: None,
            filename: None,
            temp_file_path: None,
            destination_path: None,
            remote_file_path: None,
            events: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Session-level placeholder for an album request; the session id is the
    /// record's own id.
    pub fn new_album_session(
        artist_id: i64,
        artist_name: &str,
        album_id: i64,
        album_name: &str,
    ) -> Self {
        let mut record = Self::blank(DownloadKind::Album);
        record.session_id = Some(record.id.clone());
        record.is_parent = true;
        record.artist_id = Some(artist_id);
        record.album_id = Some(album_id);
        record.artist_name = Some(artist_name.to_string());
        record.album_name = Some(album_name.to_string());
        record
    }

    /// Per-track record linked to an album session
    pub fn new_session_track(session: &DownloadRecord, track_id: Option<i64>) -> Self {
        let mut record = Self::blank(DownloadKind::Album);
        record.session_id = session.session_id.clone();
        record.artist_id = session.artist_id;
        record.album_id = session.album_id;
        record.track_id = track_id;
        record.artist_name = session.artist_name.clone();
        record.album_name = session.album_name.clone();
        record
    }

    /// Standalone single-track record
    pub fn new_track(
        artist_id: Option<i64>,
        artist_name: &str,
        track_id: Option<i64>,
        track_title: &str,
    ) -> Self {
        let mut record = Self::blank(DownloadKind::Track);
        record.artist_id = artist_id;
        record.track_id = track_id;
        record.artist_name = Some(artist_name.to_string());
        record.track_title = Some(track_title.to_string());
        record
    }

    /// Weekly-flow record; identical to a track record except for kind, and
    /// typically without a synchronous external id
    /// Record synthesized for a finished transfer no local record claims.
    /// Carries only what the service reports; library matching happens at
    /// import time.
    pub fn new_recovered_remote(
        external_id: Option<&str>,
        username: &str,
        filename: &str,
    ) -> Self {
        let mut record = Self::blank(DownloadKind::Track);
        record.external_id = external_id.map(str::to_string);
        record.username = Some(username.to_string());
        record.filename = Some(filename.to_string());
        record
    }

    pub fn new_weekly_flow(artist_name: &str, track_title: &str) -> Self {
        let mut record = Self::blank(DownloadKind::WeeklyFlow);
        record.artist_name = Some(artist_name.to_string());
        record.track_title = Some(track_title.to_string());
        record
    }

    /// Non-stale and still progressing
    pub fn is_active(&self) -> bool {
        !self.stale && !self.status.is_terminal()
    }

    /// Has a resolved file waiting for the album aggregation move
    pub fn has_pending_file(&self) -> bool {
        self.status == DownloadStatus::Completed || self.temp_file_path.is_some()
    }

    /// Human-readable identity for log lines
    pub fn display_name(&self) -> String {
        match (&self.artist_name, &self.album_name, &self.track_title) {
            (Some(artist), _, Some(track)) => format!("{} - {}", artist, track),
            (Some(artist), Some(album), None) => format!("{} - {}", artist, album),
            _ => self.id.clone(),
        }
    }

    /// Record a peer as attempted, preserving order and uniqueness
    pub fn mark_username_tried(&mut self, username: &str) {
        if !self.tried_usernames.iter().any(|u| u == username) {
            self.tried_usernames.push(username.to_string());
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Repository over the `DownloadRecords` table.
///
/// All updates are full-row saves keyed by id: the store never drops fields
/// implicitly, which is what lets the poll loop do read-modify-write cycles
/// with last-writer-wins semantics.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    pool: SqlitePool,
}

impl DownloadStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a freshly created record
    pub async fn insert(&self, record: &DownloadRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO DownloadRecords (
                id, external_id, kind, session_id, is_parent, stale,
                artist_id, album_id, track_id,
                artist_name, album_name, track_title, track_position,
                status, progress, last_progress, last_state, last_checked,
                retry_count, requeue_count, stall_retries,
                error_type, last_error, last_failure_at, last_requeue_at,
                tried_usernames, queue_cleaned,
                username, filename, temp_file_path, destination_path, remote_file_path,
                events, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.external_id)
        .bind(record.kind.as_str())
        .bind(&record.session_id)
        .bind(record.is_parent)
        .bind(record.stale)
        .bind(record.artist_id)
        .bind(record.album_id)
        .bind(record.track_id)
        .bind(&record.artist_name)
        .bind(&record.album_name)
        .bind(&record.track_title)
        .bind(record.track_position)
        .bind(record.status.as_str())
        .bind(record.progress)
        .bind(record.last_progress)
        .bind(&record.last_state)
        .bind(record.last_checked)
        .bind(record.retry_count)
        .bind(record.requeue_count)
        .bind(record.stall_retries)
        .bind(&record.error_type)
        .bind(&record.last_error)
        .bind(record.last_failure_at)
        .bind(record.last_requeue_at)
        .bind(serde_json::to_string(&record.tried_usernames)?)
        .bind(record.queue_cleaned)
        .bind(&record.username)
        .bind(&record.filename)
        .bind(&record.temp_file_path)
        .bind(&record.destination_path)
        .bind(&record.remote_file_path)
        .bind(serde_json::to_string(&record.events)?)
        .bind(record.created_at)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist every mutable field of a record
    pub async fn save(&self, record: &DownloadRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE DownloadRecords SET
                external_id = ?, session_id = ?, is_parent = ?, stale = ?,
                artist_id = ?, album_id = ?, track_id = ?,
                artist_name = ?, album_name = ?, track_title = ?, track_position = ?,
                status = ?, progress = ?, last_progress = ?, last_state = ?, last_checked = ?,
                retry_count = ?, requeue_count = ?, stall_retries = ?,
                error_type = ?, last_error = ?, last_failure_at = ?, last_requeue_at = ?,
                tried_usernames = ?, queue_cleaned = ?,
                username = ?, filename = ?, temp_file_path = ?, destination_path = ?, remote_file_path = ?,
                events = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.external_id)
        .bind(&record.session_id)
        .bind(record.is_parent)
        .bind(record.stale)
        .bind(record.artist_id)
        .bind(record.album_id)
        .bind(record.track_id)
        .bind(&record.artist_name)
        .bind(&record.album_name)
        .bind(&record.track_title)
        .bind(record.track_position)
        .bind(record.status.as_str())
        .bind(record.progress)
        .bind(record.last_progress)
        .bind(&record.last_state)
        .bind(record.last_checked)
        .bind(record.retry_count)
        .bind(record.requeue_count)
        .bind(record.stall_retries)
        .bind(&record.error_type)
        .bind(&record.last_error)
        .bind(record.last_failure_at)
        .bind(record.last_requeue_at)
        .bind(serde_json::to_string(&record.tried_usernames)?)
        .bind(record.queue_cleaned)
        .bind(&record.username)
        .bind(&record.filename)
        .bind(&record.temp_file_path)
        .bind(&record.destination_path)
        .bind(&record.remote_file_path)
        .bind(serde_json::to_string(&record.events)?)
        .bind(record.completed_at)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MuseSyncError::not_found(format!(
                "Download record: {}",
                record.id
            )));
        }

        Ok(())
    }

    /// Get a record by id
    pub async fn get(&self, id: &str) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query("SELECT * FROM DownloadRecords WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record).transpose()
    }

    /// Get a record by the external service's id
    pub async fn get_by_external_id(&self, external_id: &str) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query("SELECT * FROM DownloadRecords WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record).transpose()
    }

    /// List every record, newest first
    pub async fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query("SELECT * FROM DownloadRecords ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// List records in a given status, oldest first
    pub async fn list_by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadRecord>> {
        let rows =
            sqlx::query("SELECT * FROM DownloadRecords WHERE status = ? ORDER BY created_at ASC")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Records the poll loop and recovery reconciler consider in-flight:
    /// actively progressing, or failed with retry budget left. The bounds
    /// mirror the per-category retry budgets; the retry policy makes the
    /// per-attempt decision.
    pub async fn list_in_flight(&self) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM DownloadRecords
            WHERE stale = 0
              AND (status IN ('downloading', 'queued', 'requested', 'stalled')
                   OR (status = 'failed' AND retry_count <= CASE error_type
                         WHEN 'network' THEN 10
                         WHEN 'rate_limit' THEN 5
                         WHEN 'not_found' THEN -1
                         WHEN 'permanent' THEN -1
                         ELSE 3 END))
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Non-stale, non-terminal records for an album
    pub async fn list_active_for_album(&self, album_id: i64) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM DownloadRecords
            WHERE album_id = ? AND stale = 0
              AND status NOT IN ('completed', 'added', 'failed', 'timeout', 'cancelled', 'deleted')
            ORDER BY created_at ASC
            "#,
        )
        .bind(album_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Every record (any status) for an album, newest session first
    pub async fn list_for_album(&self, album_id: i64) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM DownloadRecords WHERE album_id = ? ORDER BY created_at DESC",
        )
        .bind(album_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Non-stale, non-parent track records of a session
    pub async fn list_session_tracks(&self, session_id: &str) -> Result<Vec<DownloadRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM DownloadRecords
            WHERE session_id = ? AND is_parent = 0 AND stale = 0
            ORDER BY created_at ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Most recent parent record for an album; `active_only` restricts to
    /// non-stale sessions.
    pub async fn latest_session_for_album(
        &self,
        album_id: i64,
        active_only: bool,
    ) -> Result<Option<DownloadRecord>> {
        let sql = if active_only {
            r#"
            SELECT * FROM DownloadRecords
            WHERE album_id = ? AND is_parent = 1 AND stale = 0
            ORDER BY created_at DESC LIMIT 1
            "#
        } else {
            r#"
            SELECT * FROM DownloadRecords
            WHERE album_id = ? AND is_parent = 1
            ORDER BY created_at DESC LIMIT 1
            "#
        };

        let row = sqlx::query(sql)
            .bind(album_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record).transpose()
    }

    /// Mark every non-terminal record for an album stale (superseded by a
    /// newer session). Terminal records keep their history untouched.
    pub async fn mark_album_sessions_stale(&self, album_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE DownloadRecords SET stale = 1
            WHERE album_id = ? AND stale = 0
              AND status NOT IN ('completed', 'added', 'failed', 'timeout', 'cancelled', 'deleted')
            "#,
        )
        .bind(album_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Convert a database row into a `DownloadRecord`
fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<DownloadRecord> {
    let kind_str: String = row.try_get("kind")?;
    let status_str: String = row.try_get("status")?;

    let tried_json: String = row.try_get("tried_usernames")?;
    let tried_usernames: Vec<String> = serde_json::from_str(&tried_json).unwrap_or_default();

    let events_json: String = row.try_get("events")?;
    let events: Vec<LoggedEvent> = serde_json::from_str(&events_json).unwrap_or_default();

    Ok(DownloadRecord {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        kind: DownloadKind::from_str(&kind_str)?,
        session_id: row.try_get("session_id")?,
        is_parent: row.try_get("is_parent")?,
        stale: row.try_get("stale")?,
        artist_id: row.try_get("artist_id")?,
        album_id: row.try_get("album_id")?,
        track_id: row.try_get("track_id")?,
        artist_name: row.try_get("artist_name")?,
        album_name: row.try_get("album_name")?,
        track_title: row.try_get("track_title")?,
        track_position: row.try_get("track_position")?,
        status: DownloadStatus::from_str(&status_str)?,
        progress: row.try_get("progress")?,
        last_progress: row.try_get("last_progress")?,
        last_state: row.try_get("last_state")?,
        last_checked: row.try_get("last_checked")?,
        retry_count: row.try_get("retry_count")?,
        requeue_count: row.try_get("requeue_count")?,
        stall_retries: row.try_get("stall_retries")?,
        error_type: row.try_get("error_type")?,
        last_error: row.try_get("last_error")?,
        last_failure_at: row.try_get("last_failure_at")?,
        last_requeue_at: row.try_get("last_requeue_at")?,
        tried_usernames,
        queue_cleaned: row.try_get("queue_cleaned")?,
        username: row.try_get("username")?,
        filename: row.try_get("filename")?,
        temp_file_path: row.try_get("temp_file_path")?,
        destination_path: row.try_get("destination_path")?,
        remote_file_path: row.try_get("remote_file_path")?,
        events,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    async fn store() -> DownloadStore {
        let db = Database::new_in_memory().await.unwrap();
        DownloadStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = store().await;

        let mut record = DownloadRecord::new_album_session(1, "Artist", 2, "Album");
        record.tried_usernames = vec!["peer1".to_string(), "peer2".to_string()];
        store.insert(&record).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.kind, DownloadKind::Album);
        assert!(loaded.is_parent);
        assert_eq!(loaded.session_id.as_deref(), Some(record.id.as_str()));
        assert_eq!(loaded.artist_name.as_deref(), Some("Artist"));
        assert_eq!(loaded.tried_usernames, vec!["peer1", "peer2"]);
        assert_eq!(loaded.status, DownloadStatus::Requested);
    }

    #[tokio::test]
    async fn test_save_preserves_all_fields() {
        let store = store().await;

        let mut record = DownloadRecord::new_track(Some(1), "Artist", Some(9), "Song");
        store.insert(&record).await.unwrap();

        record.status = DownloadStatus::Downloading;
        record.progress = 42.0;
        record.username = Some("peer".to_string());
        record.filename = Some("Artist - Song.flac".to_string());
        record.mark_username_tried("peer");
        store.save(&record).await.unwrap();

        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DownloadStatus::Downloading);
        assert_eq!(loaded.progress, 42.0);
        assert_eq!(loaded.username.as_deref(), Some("peer"));
        assert_eq!(loaded.filename.as_deref(), Some("Artist - Song.flac"));
        assert_eq!(loaded.tried_usernames, vec!["peer"]);
        // untouched fields survive the save
        assert_eq!(loaded.track_title.as_deref(), Some("Song"));
        assert_eq!(loaded.track_id, Some(9));
    }

    #[tokio::test]
    async fn test_save_unknown_record_fails() {
        let store = store().await;
        let record = DownloadRecord::new_weekly_flow("Artist", "Song");
        let err = store.save(&record).await.unwrap_err();
        assert!(matches!(err, MuseSyncError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_album_sessions_stale_spares_terminal() {
        let store = store().await;

        let session = DownloadRecord::new_album_session(1, "Artist", 7, "Album");
        store.insert(&session).await.unwrap();

        let mut done = DownloadRecord::new_session_track(&session, Some(1));
        done.status = DownloadStatus::Added;
        store.insert(&done).await.unwrap();

        let marked = store.mark_album_sessions_stale(7).await.unwrap();
        assert_eq!(marked, 1);

        let session = store.get(&session.id).await.unwrap().unwrap();
        assert!(session.stale);
        let done = store.get(&done.id).await.unwrap().unwrap();
        assert!(!done.stale, "terminal records keep their history");
    }

    #[tokio::test]
    async fn test_list_session_tracks_excludes_parent_and_stale() {
        let store = store().await;

        let session = DownloadRecord::new_album_session(1, "Artist", 7, "Album");
        store.insert(&session).await.unwrap();

        let track = DownloadRecord::new_session_track(&session, Some(1));
        store.insert(&track).await.unwrap();

        let mut stale_track = DownloadRecord::new_session_track(&session, Some(2));
        stale_track.stale = true;
        store.insert(&stale_track).await.unwrap();

        let tracks = store
            .list_session_tracks(session.session_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, track.id);
    }

    #[tokio::test]
    async fn test_list_in_flight_includes_retryable_failures() {
        let store = store().await;

        let mut downloading = DownloadRecord::new_track(Some(1), "A", None, "T1");
        downloading.status = DownloadStatus::Downloading;
        store.insert(&downloading).await.unwrap();

        let mut retryable = DownloadRecord::new_track(Some(1), "A", None, "T2");
        retryable.status = DownloadStatus::Failed;
        retryable.retry_count = 1;
        store.insert(&retryable).await.unwrap();

        let mut exhausted = DownloadRecord::new_track(Some(1), "A", None, "T3");
        exhausted.status = DownloadStatus::Failed;
        exhausted.retry_count = 4;
        store.insert(&exhausted).await.unwrap();

        let mut flaky_network = DownloadRecord::new_track(Some(1), "A", None, "T4");
        flaky_network.status = DownloadStatus::Failed;
        flaky_network.error_type = Some("network".to_string());
        flaky_network.retry_count = 8;
        store.insert(&flaky_network).await.unwrap();

        let mut missing = DownloadRecord::new_track(Some(1), "A", None, "T5");
        missing.status = DownloadStatus::Failed;
        missing.error_type = Some("not_found".to_string());
        store.insert(&missing).await.unwrap();

        let in_flight = store.list_in_flight().await.unwrap();
        let ids: Vec<&str> = in_flight.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&downloading.id.as_str()));
        assert!(ids.contains(&retryable.id.as_str()));
        assert!(!ids.contains(&exhausted.id.as_str()));
        assert!(ids.contains(&flaky_network.id.as_str()));
        assert!(!ids.contains(&missing.id.as_str()));
    }
}
