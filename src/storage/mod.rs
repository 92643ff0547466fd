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


//! SQLite persistence for the download record store (the source of truth
//! across restarts) and the library store (artists/albums/tracks).

pub mod database;
pub mod library;
pub mod migrations;
pub mod records;

pub use database::Database;
pub use library::{Album, Artist, LibraryStore, Track};
pub use records::{DownloadKind, DownloadRecord, DownloadStatus, DownloadStore};
