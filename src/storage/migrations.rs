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


//! Database migrations
//!
//! Schema creation and upgrades as runtime SQL, tracked in the
//! `_migrations` table. Runtime migrations keep the crate free of a
//! build-time database connection.

use crate::error::Result;
use sqlx::{Executor, SqlitePool};

/// Bring the schema up to date, applying pending migrations in order
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (\
             id INTEGER PRIMARY KEY,\
             name TEXT NOT NULL UNIQUE,\
             applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP\
         )",
    )
    .await?;

    apply(pool, 1, "initial_schema", create_initial_schema(pool)).await?;

    Ok(())
}

/// Apply one migration unless the tracking table says it already ran
async fn apply(
    pool: &SqlitePool,
    id: i32,
    name: &str,
    migration: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    let seen: Option<i32> = sqlx::query_scalar("SELECT id FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    if seen.is_some() {
        return Ok(());
    }

    migration.await?;

    sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Create initial database schema
async fn create_initial_schema(pool: &SqlitePool) -> Result<()> {
    pool.execute(
        r#"
-- ============================================================================
-- LIBRARY ENTITIES
-- ============================================================================

CREATE TABLE IF NOT EXISTS Artists (
    artist_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    monitored INTEGER NOT NULL DEFAULT 0,
    path TEXT,
    album_count INTEGER NOT NULL DEFAULT 0,
    track_count INTEGER NOT NULL DEFAULT 0,
    track_file_count INTEGER NOT NULL DEFAULT 0,
    size_on_disk INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS Albums (
    album_id INTEGER PRIMARY KEY AUTOINCREMENT,
    artist_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    year INTEGER,
    -- request lifecycle: wanted -> available
    request_status TEXT NOT NULL DEFAULT 'wanted',
    path TEXT,
    track_count INTEGER NOT NULL DEFAULT 0,
    track_file_count INTEGER NOT NULL DEFAULT 0,
    size_on_disk INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,

    FOREIGN KEY (artist_id) REFERENCES Artists (artist_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS Tracks (
    track_id INTEGER PRIMARY KEY AUTOINCREMENT,
    album_id INTEGER NOT NULL,
    artist_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    has_file INTEGER NOT NULL DEFAULT 0,
    file_path TEXT,

    FOREIGN KEY (album_id) REFERENCES Albums (album_id) ON DELETE CASCADE,
    FOREIGN KEY (artist_id) REFERENCES Artists (artist_id) ON DELETE CASCADE
);

-- ============================================================================
-- DOWNLOAD RECORDS
-- ============================================================================

-- Append-mostly audit record, one per requested album session / track / flow
-- item. Never deleted; superseded records are marked stale.
CREATE TABLE IF NOT EXISTS DownloadRecords (
    id TEXT PRIMARY KEY,
    external_id TEXT,
    kind TEXT NOT NULL,

    -- session linkage
    session_id TEXT,
    is_parent INTEGER NOT NULL DEFAULT 0,
    stale INTEGER NOT NULL DEFAULT 0,

    -- target references (denormalized names for matching without re-query)
    artist_id INTEGER,
    album_id INTEGER,
    track_id INTEGER,
    artist_name TEXT,
    album_name TEXT,
    track_title TEXT,
    track_position INTEGER,

    -- status
    status TEXT NOT NULL DEFAULT 'requested',
    progress REAL NOT NULL DEFAULT 0,
    last_progress REAL NOT NULL DEFAULT 0,
    last_state TEXT,
    last_checked TEXT,

    -- failure bookkeeping
    retry_count INTEGER NOT NULL DEFAULT 0,
    requeue_count INTEGER NOT NULL DEFAULT 0,
    stall_retries INTEGER NOT NULL DEFAULT 0,
    error_type TEXT,
    last_error TEXT,
    last_failure_at TEXT,
    last_requeue_at TEXT,
    tried_usernames TEXT NOT NULL DEFAULT '[]',
    queue_cleaned INTEGER NOT NULL DEFAULT 0,

    -- file bookkeeping
    username TEXT,
    filename TEXT,
    temp_file_path TEXT,
    destination_path TEXT,
    remote_file_path TEXT,

    -- audit trail (JSON array, newest last, capped at 100)
    events TEXT NOT NULL DEFAULT '[]',

    created_at TEXT NOT NULL,
    completed_at TEXT
);

-- ============================================================================
-- INDEXES
-- ============================================================================

CREATE INDEX IF NOT EXISTS ix_albums_artist ON Albums (artist_id);
CREATE INDEX IF NOT EXISTS ix_tracks_album ON Tracks (album_id);
CREATE INDEX IF NOT EXISTS ix_records_status ON DownloadRecords (status);
CREATE INDEX IF NOT EXISTS ix_records_album ON DownloadRecords (album_id);
CREATE INDEX IF NOT EXISTS ix_records_session ON DownloadRecords (session_id);
CREATE INDEX IF NOT EXISTS ix_records_external ON DownloadRecords (external_id);
        "#,
    )
    .await?;

    Ok(())
}
