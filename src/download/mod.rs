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

//! Download orchestration
//!
//! The orchestrator sits between the local library database and the
//! peer-network download service: it submits searches, records every
//! attempt, polls the service for state, classifies failures, and moves
//! finished files into the library.

pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod retry;

pub use errors::{classify_failure, ErrorCategory, Failure};
pub use events::{apply_event, DownloadEvent, LoggedEvent, EVENT_LOG_CAP};
pub use orchestrator::DownloadOrchestrator;
pub use retry::RetryPolicy;

use crate::error::Result;
use crate::slskd::TrackCandidate;
use crate::storage::records::DownloadRecord;
use async_trait::async_trait;
use std::path::Path;

/// External metadata source consulted when the local database has no
/// tracklist for an album. Callers bound it with a short timeout and
/// degrade to an empty tracklist when it is slow or failing.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn album_tracklist(
        &self,
        artist_name: &str,
        album_name: &str,
    ) -> Result<Vec<TrackCandidate>>;
}

/// Fallback matcher for files that could not be paired with a library
/// track by name alone (tag probing, acoustic fingerprinting, etc.)
#[async_trait]
pub trait FileMatcher: Send + Sync {
    /// Returns true if the file was matched and recorded against one of
    /// the artist's tracks
    async fn match_file_to_track(&self, file_path: &Path, artist_id: i64) -> Result<bool>;
}

/// Hand-off point for album requests accepted by [`DownloadOrchestrator::queue_album_download`].
/// Hosts typically feed these into a worker that calls `download_album`.
pub trait DownloadQueue: Send + Sync {
    fn enqueue(&self, record: &DownloadRecord) -> Result<()>;
}
