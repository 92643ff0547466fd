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


//! SQLite connection handling
//!
//! One pool serves both the download record store and the library store.
//! WAL journaling, enforced foreign keys, and normal synchronous mode;
//! migrations run on open so a handle is always schema-current.

use crate::error::{MuseSyncError, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
        SqliteSynchronous},
    ConnectOptions,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

fn base_options(connection_string: &str) -> Result<SqliteConnectOptions> {
    Ok(SqliteConnectOptions::from_str(connection_string)?
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        .disable_statement_logging())
}

/// Owns the connection pool; cheap to clone
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    /// `None` for in-memory databases
    path: Option<PathBuf>,
}

impl Database {
    /// Open the database at `database_path`, creating the file and its
    /// parent directory when missing, and bring the schema up to date.
    pub async fn new<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let path = database_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    MuseSyncError::FileIoError(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = base_options(&format!("sqlite://{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests. Pooled at a single connection; each
    /// `:memory:` connection would otherwise see its own empty database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_options("sqlite::memory:")?)
            .await?;

        let db = Self { pool, path: None };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply pending migrations; a no-op when already current
    pub async fn migrate(&self) -> Result<()> {
        crate::storage::migrations::run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Backing file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Drain and close all connections
    pub async fn close(self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
