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


//! External download service integration
//!
//! The orchestrator only ever talks to the peer-network download daemon
//! through the [`DownloadClient`] trait; [`client::SlskdClient`] is the real
//! HTTP implementation and tests substitute mocks. Every payload is
//! normalized into the canonical shapes in [`types`] immediately after the
//! wire call, so nothing downstream branches on raw API shapes.

pub mod client;
pub mod types;

pub use client::{SlskdClient, SlskdConfig};
pub use types::{RemoteDownload, RemoteDownloadDetail, RemoteState};

use crate::error::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// A track the caller hopes to find inside a search result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackCandidate {
    pub track_id: Option<i64>,
    pub title: String,
    pub position: Option<i64>,
}

/// One search-and-download request
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Free-text search, usually `"artist album"` or `"artist track"`
    pub text: String,
    /// Tracklist the caller expects, when known; used to size up candidates
    pub tracks: Vec<TrackCandidate>,
    /// Peers already attempted for this request; never re-selected
    pub exclude_usernames: Vec<String>,
}

/// One file the service agreed to download
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    /// Transfer id, absent when the service assigns ids asynchronously
    pub id: Option<String>,
    pub username: String,
    pub filename: String,
    pub size: i64,
    /// The candidate this file was matched against, if the service matched one
    pub track: Option<TrackCandidate>,
}

/// Contract with the external peer-network download daemon.
///
/// The core submits requests and polls status; the daemon does the actual
/// transfers.
#[async_trait]
pub trait DownloadClient: Send + Sync {
    /// Whether the service has a usable configuration at all
    fn is_configured(&self) -> bool;

    /// Search the peer network and enqueue downloads for the best result set
    async fn search_and_download(&self, query: &SearchQuery) -> Result<Vec<DownloadHandle>>;

    /// Current download list, flattened to one entry per file
    async fn get_downloads(&self) -> Result<Vec<RemoteDownload>>;

    /// Per-item detail; may include a direct local file path
    async fn get_download(&self, id: &str) -> Result<Option<RemoteDownloadDetail>>;

    /// Cancel a transfer by id
    async fn cancel_download(&self, id: &str) -> Result<()>;

    /// The daemon's configured download directory
    async fn download_directory(&self) -> Result<PathBuf>;
}
