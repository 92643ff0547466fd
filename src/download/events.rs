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

//! Record lifecycle events
//!
//! Every state transition goes through [`apply_event`], a pure reducer that
//! updates the record's fields and appends a timestamped entry to its audit
//! trail. The trail is persisted as a JSON column and capped at
//! [`EVENT_LOG_CAP`] entries, oldest dropped first.

use crate::storage::records::{DownloadRecord, DownloadStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum audit-trail entries kept per record
pub const EVENT_LOG_CAP: usize = 100;

/// One lifecycle transition of a download record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// Accepted by the external service's queue
    Queued,
    /// Transfer started (or peer/filename became known)
    Started {
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    /// Observed progress change
    Progress { progress: f64 },
    /// No observable change past the stall thresholds
    Stalled,
    /// Transfer finished on the remote side; file located locally
    Completed {
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_file_path: Option<String>,
    },
    /// File moved into its final library location
    Moved { destination_path: String },
    /// File matched to a library track and the track marked on-disk
    AddedToLibrary {
        #[serde(skip_serializing_if = "Option::is_none")]
        track_id: Option<i64>,
    },
    Failed {
        error_type: String,
        message: String,
    },
    /// Gave up waiting for the external service
    TimedOut,
    Cancelled,
    /// Fresh attempt submitted after a failure or stall
    Requeued,
}

/// Audit-trail entry: the event plus when it was applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DownloadEvent,
}

/// Apply one event to a record, returning the updated record.
///
/// Field updates and the audit append happen together so the trail can
/// never disagree with the record's current state.
pub fn apply_event(
    mut record: DownloadRecord,
    event: DownloadEvent,
    at: DateTime<Utc>,
) -> DownloadRecord {
    match &event {
        DownloadEvent::Queued => {
            record.status = DownloadStatus::Queued;
        }
        DownloadEvent::Started { username, filename } => {
            record.status = DownloadStatus::Downloading;
            if let Some(username) = username {
                record.username = Some(username.clone());
                record.mark_username_tried(username);
            }
            if filename.is_some() {
                record.filename = filename.clone();
            }
            record.last_checked = Some(at);
        }
        DownloadEvent::Progress { progress } => {
            record.status = DownloadStatus::Downloading;
            record.last_progress = record.progress;
            record.progress = *progress;
            record.last_checked = Some(at);
        }
        DownloadEvent::Stalled => {
            record.status = DownloadStatus::Stalled;
            record.stall_retries += 1;
        }
        DownloadEvent::Completed { temp_file_path } => {
            record.status = DownloadStatus::Completed;
            record.progress = 100.0;
            record.completed_at = Some(at);
            if temp_file_path.is_some() {
                record.temp_file_path = temp_file_path.clone();
            }
        }
        DownloadEvent::Moved { destination_path } => {
            record.destination_path = Some(destination_path.clone());
            record.temp_file_path = None;
        }
        DownloadEvent::AddedToLibrary { track_id } => {
            record.status = DownloadStatus::Added;
            if track_id.is_some() {
                record.track_id = *track_id;
            }
            if record.completed_at.is_none() {
                record.completed_at = Some(at);
            }
        }
        DownloadEvent::Failed {
            error_type,
            message,
        } => {
            record.status = DownloadStatus::Failed;
            record.retry_count += 1;
            record.error_type = Some(error_type.clone());
            record.last_error = Some(message.clone());
            record.last_failure_at = Some(at);
        }
        DownloadEvent::TimedOut => {
            record.status = DownloadStatus::Timeout;
            record.last_failure_at = Some(at);
        }
        DownloadEvent::Cancelled => {
            record.status = DownloadStatus::Cancelled;
        }
        DownloadEvent::Requeued => {
            record.status = DownloadStatus::Requested;
            record.requeue_count += 1;
            record.last_requeue_at = Some(at);
            record.progress = 0.0;
            record.last_progress = 0.0;
            record.last_state = None;
            record.external_id = None;
            record.temp_file_path = None;
        }
    }

    record.events.push(LoggedEvent {
        timestamp: at,
        event,
    });
    let overflow = record.events.len().saturating_sub(EVENT_LOG_CAP);
    if overflow > 0 {
        record.events.drain(..overflow);
    }

    record
}
