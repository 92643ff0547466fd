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

//! Orchestrator configuration
//!
//! Directory roots, remote-to-local path mappings for containerized
//! deployments, and the timing thresholds that drive the poll loops.
//! All durations are stored as seconds so the struct deserializes cleanly
//! from flat JSON/TOML settings files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maps a path prefix as seen by the external download service to the prefix
/// under which the same files are mounted for this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathMapping {
    /// Prefix reported by the external service (e.g. `/downloads`)
    pub remote: PathBuf,
    /// Prefix as mounted locally (e.g. `/mnt/slskd/downloads`)
    pub local: PathBuf,
}

impl PathMapping {
    /// Apply this mapping to a candidate path. Returns `None` when the
    /// candidate does not start with the remote prefix.
    pub fn apply(&self, candidate: &Path) -> Option<PathBuf> {
        candidate
            .strip_prefix(&self.remote)
            .ok()
            .map(|rest| self.local.join(rest))
    }
}

/// Configuration for the download orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory where the external service places finished downloads
    pub complete_dir: PathBuf,
    /// Directory where the external service stages in-progress downloads
    pub incomplete_dir: PathBuf,
    /// Root of the music library tree files are relocated into
    pub library_dir: PathBuf,
    /// Remote-to-local path prefix substitutions, tried in order
    pub path_mappings: Vec<PathMapping>,

    /// Upper bound for best-effort metadata (tracklist) lookups
    pub metadata_timeout_secs: u64,

    /// No status change for this long means the download is stalled
    pub stall_no_change_secs: u64,
    /// Unchanged progress for this long means the download is stalled
    pub stall_no_progress_secs: u64,
    /// Stall retries per record before giving up
    pub max_stall_retries: u32,

    /// Records with no matching remote entry are retried after this long
    pub unmatched_retry_secs: u64,
    /// ...and treated as timed out after this long
    pub unmatched_timeout_secs: u64,
    /// Remote entries younger than this are left to settle during recovery
    pub recovery_settle_secs: u64,

    /// Minimum age of a failure before the requeue sweep considers it
    pub requeue_min_failure_age_secs: u64,
    /// Minimum spacing between requeue attempts for the same record
    pub requeue_spacing_secs: u64,
    /// Requeue sweep skips records with this many failed attempts or more
    pub max_requeue_retries: u32,

    /// Depth bound for the fuzzy recursive file search fallback
    pub search_max_depth: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            complete_dir: PathBuf::from("/downloads/complete"),
            incomplete_dir: PathBuf::from("/downloads/incomplete"),
            library_dir: PathBuf::from("/music"),
            path_mappings: Vec::new(),
            metadata_timeout_secs: 5,
            stall_no_change_secs: 10 * 60,
            stall_no_progress_secs: 15 * 60,
            max_stall_retries: 3,
            unmatched_retry_secs: 10 * 60,
            unmatched_timeout_secs: 30 * 60,
            recovery_settle_secs: 5 * 60,
            requeue_min_failure_age_secs: 30 * 60,
            requeue_spacing_secs: 60 * 60,
            max_requeue_retries: 3,
            search_max_depth: 6,
        }
    }
}

impl DownloadConfig {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn stall_no_change(&self) -> Duration {
        Duration::from_secs(self.stall_no_change_secs)
    }

    pub fn stall_no_progress(&self) -> Duration {
        Duration::from_secs(self.stall_no_progress_secs)
    }

    pub fn unmatched_retry(&self) -> Duration {
        Duration::from_secs(self.unmatched_retry_secs)
    }

    pub fn unmatched_timeout(&self) -> Duration {
        Duration::from_secs(self.unmatched_timeout_secs)
    }

    pub fn recovery_settle(&self) -> Duration {
        Duration::from_secs(self.recovery_settle_secs)
    }

    pub fn requeue_min_failure_age(&self) -> Duration {
        Duration::from_secs(self.requeue_min_failure_age_secs)
    }

    pub fn requeue_spacing(&self) -> Duration {
        Duration::from_secs(self.requeue_spacing_secs)
    }

    /// Map a path reported by the external service into the local mount,
    /// returning the original path when no mapping matches.
    pub fn map_remote_path(&self, candidate: &Path) -> PathBuf {
        for mapping in &self.path_mappings {
            if let Some(mapped) = mapping.apply(candidate) {
                return mapped;
            }
        }
        candidate.to_path_buf()
    }
}
