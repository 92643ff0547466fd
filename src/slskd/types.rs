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


//! Canonical shapes for external download service payloads
//!
//! The daemon's transfer list comes in two shapes depending on API version:
//! a flat array of files, or an array of peers each holding directories of
//! files. [`flatten_downloads`] collapses both into one `Vec<RemoteDownload>`
//! right after the wire call.
//!
//! Status strings are free-form and composite ("Completed, Errored",
//! "Queued, Remotely"). [`normalize_state`] evaluates an ordered rule list
//! whose order is load-bearing: error indicators must outrank completion
//! indicators or a partially-errored transfer would be imported.

use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

/// Canonical status of a remote transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Completed,
    Failed,
    Cancelled,
    Downloading,
    Queued,
    Unknown,
}

/// Ordered (indicators, state) rules, evaluated top to bottom; first match
/// wins. "Completed, Errored" must classify as Failed, not Completed.
const STATE_RULES: &[(&[&str], RemoteState)] = &[
    (&["errored", "failed", "rejected"], RemoteState::Failed),
    (&["cancelled", "canceled", "aborted"], RemoteState::Cancelled),
    (&["completed", "succeeded"], RemoteState::Completed),
    (
        &["inprogress", "in progress", "transferring", "initializing"],
        RemoteState::Downloading,
    ),
    (&["queued", "requested"], RemoteState::Queued),
];

/// Normalize a raw service status string into a [`RemoteState`]
pub fn normalize_state(raw: &str) -> RemoteState {
    let lowered = raw.to_ascii_lowercase();
    for (needles, state) in STATE_RULES {
        if needles.iter().any(|n| lowered.contains(n)) {
            return *state;
        }
    }
    RemoteState::Unknown
}

/// One file transfer as the core sees it, regardless of wire shape
#[derive(Debug, Clone)]
pub struct RemoteDownload {
    /// Transfer id (absent on some API versions until assigned)
    pub id: Option<String>,
    pub username: String,
    pub filename: String,
    pub size: i64,
    pub bytes_transferred: i64,
    /// 0-100
    pub percent_complete: f64,
    /// Raw status string as reported, kept for the audit trail
    pub raw_state: String,
    pub state: RemoteState,
}

impl RemoteDownload {
    /// Progress percentage, preferring the reported figure over a computed one
    pub fn progress(&self) -> f64 {
        if self.percent_complete > 0.0 {
            self.percent_complete
        } else if self.size > 0 {
            (self.bytes_transferred as f64 / self.size as f64) * 100.0
        } else {
            0.0
        }
    }

    /// Stand-in entry used by recovery when a file is found on disk but the
    /// remote service no longer lists the transfer.
    pub fn synthesized(username: Option<&str>, filename: &str) -> Self {
        Self {
            id: None,
            username: username.unwrap_or_default().to_string(),
            filename: filename.to_string(),
            size: 0,
            bytes_transferred: 0,
            percent_complete: 100.0,
            raw_state: "Completed, Succeeded (synthesized)".to_string(),
            state: RemoteState::Completed,
        }
    }
}

/// Per-item detail from the service's detail endpoint
#[derive(Debug, Clone)]
pub struct RemoteDownloadDetail {
    pub download: RemoteDownload,
    /// Direct local path to the file, when the service reports one
    pub direct_path: Option<PathBuf>,
}

// ============================================================================
// RAW WIRE SHAPES
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFile {
    id: Option<String>,
    username: Option<String>,
    filename: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    bytes_transferred: i64,
    #[serde(default)]
    percent_complete: f64,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDirectory {
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPeer {
    username: String,
    #[serde(default)]
    directories: Vec<RawDirectory>,
    #[serde(default)]
    files: Vec<RawFile>,
}

fn file_to_download(file: RawFile, peer_username: Option<&str>) -> RemoteDownload {
    let state = normalize_state(&file.state);
    RemoteDownload {
        id: file.id,
        username: file
            .username
            .or_else(|| peer_username.map(|u| u.to_string()))
            .unwrap_or_default(),
        filename: file.filename,
        size: file.size,
        bytes_transferred: file.bytes_transferred,
        percent_complete: file.percent_complete,
        raw_state: file.state,
        state,
    }
}

/// Flatten a transfer-list payload into one entry per file.
///
/// Accepts either a flat array of files or the nested per-peer/per-directory
/// shape. Unrecognized elements are skipped rather than failing the whole
/// list; the poll loop tolerates partial data better than no data.
pub fn flatten_downloads(payload: Value) -> Vec<RemoteDownload> {
    let Value::Array(items) = payload else {
        return Vec::new();
    };

    let mut result = Vec::new();
    for item in items {
        // nested shape first: a peer object carries a username and no filename
        if item.get("filename").is_none() {
            if let Ok(peer) = serde_json::from_value::<RawPeer>(item.clone()) {
                let username = peer.username.clone();
                for file in peer.files {
                    result.push(file_to_download(file, Some(&username)));
                }
                for dir in peer.directories {
                    for file in dir.files {
                        result.push(file_to_download(file, Some(&username)));
                    }
                }
                continue;
            }
        }
        if let Ok(file) = serde_json::from_value::<RawFile>(item) {
            result.push(file_to_download(file, None));
        }
    }
    result
}

/// Decode a single transfer detail payload
pub fn decode_detail(payload: Value) -> Option<RemoteDownloadDetail> {
    let direct_path = payload
        .get("localFilename")
        .or_else(|| payload.get("path"))
        .and_then(|v| v.as_str())
        .map(PathBuf::from);

    let file: RawFile = serde_json::from_value(payload).ok()?;
    Some(RemoteDownloadDetail {
        download: file_to_download(file, None),
        direct_path,
    })
}
