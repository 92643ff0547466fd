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

//! Startup reconciliation
//!
//! After a restart the record store and the download service can disagree:
//! transfers finished while the process was down, the service restarted
//! and forgot its queue, or files landed on disk without their records
//! advancing. Recovery runs once per process, compares both sides with a
//! single remote fetch, and settles every record it can.

use crate::download::errors::{classify_failure, ErrorCategory, Failure};
use crate::download::events::{apply_event, DownloadEvent};
use crate::error::Result;
use crate::file::resolver::basename;
use crate::slskd::{RemoteDownload, RemoteState};
use crate::storage::records::{DownloadKind, DownloadRecord};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::orchestrator::{matches_deferred, DownloadOrchestrator};

impl DownloadOrchestrator {
    /// Reconcile persisted records with the service's current download
    /// list. Later calls in the same process are no-ops.
    pub async fn recover_interrupted_downloads(&self) -> Result<()> {
        if self.recovery_done.swap(true, Ordering::SeqCst) {
            debug!("recovery already ran this process");
            return Ok(());
        }

        let records = self.store.list_in_flight().await?;
        if records.is_empty() {
            info!("recovery: no interrupted downloads");
            return Ok(());
        }

        // one fetch for the whole pass
        let remote = self.client.get_downloads().await?;
        info!(
            local = records.len(),
            remote = remote.len(),
            "recovery: reconciling interrupted downloads"
        );

        let mut matched_remote: HashSet<usize> = HashSet::new();
        let mut without_id: Vec<DownloadRecord> = Vec::new();

        for record in records {
            if record.is_parent {
                continue;
            }
            let Some(external_id) = record.external_id.clone() else {
                // settled after the orphan pass below
                without_id.push(record);
                continue;
            };

            let entry_idx = remote
                .iter()
                .position(|e| e.id.as_deref() == Some(external_id.as_str()));
            let outcome = match entry_idx {
                Some(idx) => {
                    matched_remote.insert(idx);
                    self.recover_matched(record, &remote[idx]).await
                }
                None => self.recover_unlisted(record).await,
            };
            if let Err(e) = outcome {
                warn!(error = %e, "recovery: record reconciliation failed, continuing");
            }
        }

        // orphan pass: completed remote entries nothing claimed by id are
        // matched against the records that never got an id; entries no
        // record claims at all get a synthesized one so the finished file
        // still reaches the library
        for (idx, entry) in remote.iter().enumerate() {
            if matched_remote.contains(&idx) || entry.state != RemoteState::Completed {
                continue;
            }
            matched_remote.insert(idx);
            let record = match without_id.iter().position(|r| matches_deferred(r, entry)) {
                Some(pos) => {
                    let record = without_id.swap_remove(pos);
                    info!(name = %record.display_name(), "recovery: orphan completion matched");
                    record
                }
                None => {
                    info!(filename = %entry.filename, "recovery: adopting unclaimed finished transfer");
                    let record = DownloadRecord::new_recovered_remote(
                        entry.id.as_deref(),
                        &entry.username,
                        &entry.filename,
                    );
                    if let Err(e) = self.store.insert(&record).await {
                        warn!(error = %e, "recovery: could not record unclaimed transfer, continuing");
                        continue;
                    }
                    record
                }
            };
            if let Err(e) = self.handle_completed(record, entry).await {
                warn!(error = %e, "recovery: orphan completion failed, continuing");
            }
        }

        for record in without_id {
            if let Err(e) = self.recover_unlisted(record).await {
                warn!(error = %e, "recovery: record reconciliation failed, continuing");
            }
        }

        Ok(())
    }

    /// The service still lists the transfer: settle it by its state
    async fn recover_matched(&self, record: DownloadRecord, entry: &RemoteDownload) -> Result<()> {
        match entry.state {
            RemoteState::Completed => {
                info!(name = %record.display_name(), "recovery: transfer finished while down");
                self.handle_completed(record, entry).await
            }
            RemoteState::Failed => {
                let failure = Failure::new(format!("remote failure: {}", entry.raw_state), None);
                let category = classify_failure(&failure);
                self.fail_record(record, category, failure.message).await
            }
            RemoteState::Cancelled => {
                let record = apply_event(record, DownloadEvent::Cancelled, Utc::now());
                self.store.save(&record).await
            }
            _ => self.handle_remote_state(record, entry).await,
        }
    }

    /// The service no longer lists the transfer. Young records get time to
    /// settle; otherwise check the disk before giving up.
    async fn recover_unlisted(&self, record: DownloadRecord) -> Result<()> {
        let now = Utc::now();
        let age = (now - record.created_at).to_std().unwrap_or(Duration::ZERO);

        if age < self.config.recovery_settle() {
            debug!(name = %record.display_name(), "recovery: record too young, leaving to the poll loop");
            return Ok(());
        }

        // the file may have landed even though the service forgot the
        // transfer
        if let Some(destination) = &record.destination_path {
            if tokio::fs::try_exists(destination).await.unwrap_or(false) {
                info!(name = %record.display_name(), "recovery: destination already on disk");
                let filename = record
                    .filename
                    .clone()
                    .unwrap_or_else(|| basename(destination));
                let entry = RemoteDownload::synthesized(record.username.as_deref(), &filename);
                return self.handle_completed(record, &entry).await;
            }
        }
        if let Some(temp) = record.temp_file_path.clone() {
            if tokio::fs::try_exists(&temp).await.unwrap_or(false) {
                // resolution already happened before the restart
                info!(name = %record.display_name(), "recovery: parked file found, resuming import");
                match record.kind {
                    DownloadKind::Track | DownloadKind::WeeklyFlow => {
                        let source = PathBuf::from(&temp);
                        return self.import_single_track(record, &source).await;
                    }
                    DownloadKind::Album => {
                        let record = apply_event(
                            record,
                            DownloadEvent::Completed {
                                temp_file_path: None,
                            },
                            now,
                        );
                        self.store.save(&record).await?;
                        return self.evaluate_album_session(&record).await;
                    }
                }
            }
        }

        if age >= self.config.unmatched_timeout() {
            warn!(name = %record.display_name(), "recovery: transfer vanished, marking failed");
            self.fail_record(
                record,
                ErrorCategory::Unknown,
                "transfer missing from service after restart".to_string(),
            )
            .await
        } else {
            // not yet overdue; the poll loop takes it from here
            debug!(name = %record.display_name(), "recovery: transfer unlisted, leaving to the poll loop");
            Ok(())
        }
    }
}
