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

//! The download orchestrator
//!
//! Submission paths create a [`DownloadRecord`] *before* touching the
//! external service, so every attempt leaves an audit row even when the
//! submission itself fails. The poll loop then drives each record through
//! its lifecycle: matching it against the service's download list,
//! recording progress, detecting stalls, classifying failures, and moving
//! finished files into the library.
//!
//! Album downloads are grouped into sessions and imported all-or-nothing:
//! per-track files park in `temp_file_path` until every track of the
//! session has finished, then the whole set moves in one pass.

use crate::config::DownloadConfig;
use crate::download::errors::{classify_failure, ErrorCategory, Failure};
use crate::download::events::{apply_event, DownloadEvent};
use crate::download::retry::RetryPolicy;
use crate::download::{DownloadQueue, FileMatcher, MetadataLookup};
use crate::error::{MuseSyncError, Result};
use crate::file::resolver::basename;
use crate::file::{sanitize_component, FileRelocator, PathResolver};
use crate::slskd::{
    DownloadClient, DownloadHandle, RemoteDownload, RemoteState, SearchQuery, TrackCandidate,
};
use crate::storage::library::{count_audio_files, Album, Artist, LibraryStore, Track};
use crate::storage::records::{DownloadKind, DownloadRecord, DownloadStatus, DownloadStore};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Coordinates the download service, the record store, and the library
pub struct DownloadOrchestrator {
    pub(super) config: DownloadConfig,
    pub(super) store: DownloadStore,
    pub(super) library: LibraryStore,
    pub(super) client: Arc<dyn DownloadClient>,
    queue: Option<Arc<dyn DownloadQueue>>,
    metadata: Option<Arc<dyn MetadataLookup>>,
    file_matcher: Option<Arc<dyn FileMatcher>>,
    pub(super) resolver: PathResolver,
    pub(super) relocator: FileRelocator,

    /// Re-entrancy guard for the poll loop; overlapping ticks skip
    poll_in_flight: AtomicBool,
    /// Startup reconciliation runs once per process
    pub(super) recovery_done: AtomicBool,
    /// Download directory as the service reports it, fetched once
    download_dir: OnceCell<PathBuf>,
}

impl DownloadOrchestrator {
    pub fn new(
        config: DownloadConfig,
        store: DownloadStore,
        library: LibraryStore,
        client: Arc<dyn DownloadClient>,
    ) -> Self {
        let resolver = PathResolver::new(config.clone());
        let relocator = FileRelocator::new(vec![
            config.complete_dir.clone(),
            config.incomplete_dir.clone(),
        ]);
        Self {
            config,
            store,
            library,
            client,
            queue: None,
            metadata: None,
            file_matcher: None,
            resolver,
            relocator,
            poll_in_flight: AtomicBool::new(false),
            recovery_done: AtomicBool::new(false),
            download_dir: OnceCell::new(),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn DownloadQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_metadata_lookup(mut self, metadata: Arc<dyn MetadataLookup>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_file_matcher(mut self, file_matcher: Arc<dyn FileMatcher>) -> Self {
        self.file_matcher = Some(file_matcher);
        self
    }

    pub fn store(&self) -> &DownloadStore {
        &self.store
    }

    // ========================================================================
    // SUBMISSION
    // ========================================================================

    /// Accept an album request: record it and hand it to the work queue.
    ///
    /// Albums the library already holds short-circuit to a synthetic
    /// completed record without touching the external service.
    pub async fn queue_album_download(
        &self,
        artist_id: i64,
        album_id: i64,
    ) -> Result<DownloadRecord> {
        let artist = self.library.require_artist(artist_id).await?;
        let album = self.library.require_album(album_id).await?;
        if album.artist_id != artist_id {
            return Err(MuseSyncError::DataConsistency(format!(
                "album {} belongs to artist {}, not {}",
                album_id, album.artist_id, artist_id
            )));
        }

        let tracks = self.library.list_album_tracks(album_id).await?;
        if self.album_already_complete(&artist, &album, &tracks).await? {
            info!(artist = %artist.name, album = %album.title, "album already on disk, skipping request");
            return self.synthetic_completed_session(&artist, &album).await;
        }

        // an active session that already got downloads keeps priority
        if let Some(existing) = self.active_session_with_downloads(album_id).await? {
            debug!(album = %album.title, id = %existing.id, "active session already downloading");
            return Ok(existing);
        }

        // a new request supersedes whatever sessions were still open
        self.store.mark_album_sessions_stale(album_id).await?;

        let record =
            DownloadRecord::new_album_session(artist_id, &artist.name, album_id, &album.title);
        self.store.insert(&record).await?;
        info!(artist = %artist.name, album = %album.title, id = %record.id, "album download queued");

        if let Some(queue) = &self.queue {
            queue.enqueue(&record)?;
        }
        Ok(record)
    }

    /// Search the peer network for an album and enqueue one download per
    /// returned file, linked together as a session.
    ///
    /// `parent_download_id` carries the record created by
    /// [`Self::queue_album_download`] when the call comes off the work queue.
    pub async fn download_album(
        &self,
        artist_id: i64,
        album_id: i64,
        parent_download_id: Option<&str>,
    ) -> Result<DownloadRecord> {
        if !self.client.is_configured() {
            return Err(MuseSyncError::ServiceNotConfigured);
        }

        let artist = self.library.require_artist(artist_id).await?;
        let album = self.library.require_album(album_id).await?;
        if album.artist_id != artist_id {
            // fatal: retrying cannot fix mismatched identifiers
            return Err(MuseSyncError::DataConsistency(format!(
                "album {} belongs to artist {}, not {}",
                album_id, album.artist_id, artist_id
            )));
        }

        let tracks = self.library.list_album_tracks(album_id).await?;
        if self.album_already_complete(&artist, &album, &tracks).await? {
            info!(artist = %artist.name, album = %album.title, "album already on disk");
            return self.synthetic_completed_session(&artist, &album).await;
        }

        if parent_download_id.is_none() {
            // an active session that already got downloads keeps priority
            if let Some(existing) = self.active_session_with_downloads(album_id).await? {
                debug!(album = %album.title, id = %existing.id, "active session already downloading");
                return Ok(existing);
            }
            self.store.mark_album_sessions_stale(album_id).await?;
        }

        let mut parent = match parent_download_id {
            Some(id) => self
                .store
                .get(id)
                .await?
                .ok_or_else(|| MuseSyncError::RecordNotFound(id.to_string()))?,
            None => {
                let record = DownloadRecord::new_album_session(
                    artist_id,
                    &artist.name,
                    album_id,
                    &album.title,
                );
                self.store.insert(&record).await?;
                record
            }
        };

        let candidates = self.tracklist_candidates(&artist, &album, &tracks).await;
        let query = SearchQuery {
            text: format!("{} {}", artist.name, album.title),
            tracks: candidates.clone(),
            exclude_usernames: Vec::new(),
        };

        let handles = match self.client.search_and_download(&query).await {
            Ok(handles) => handles,
            Err(e) => {
                let failure = Failure::from_error(&e);
                let category = classify_failure(&failure);
                self.fail_record(parent, category, failure.message).await?;
                return Err(e);
            }
        };

        if handles.is_empty() {
            self.fail_record(
                parent,
                ErrorCategory::NotFound,
                "no peer offered the requested files".to_string(),
            )
            .await?;
            return Err(MuseSyncError::NoCandidatesFound(format!(
                "{} {}",
                artist.name, album.title
            )));
        }

        let now = Utc::now();
        for handle in &handles {
            let candidate = handle
                .track
                .clone()
                .or_else(|| match_candidate(&handle.filename, &candidates));
            let mut record =
                DownloadRecord::new_session_track(&parent, candidate.as_ref().and_then(|c| c.track_id));
            if let Some(candidate) = &candidate {
                record.track_title = Some(candidate.title.clone());
                record.track_position = candidate.position;
            }
            adopt_handle(&mut record, handle);
            let record = apply_event(record, DownloadEvent::Queued, now);
            self.store.insert(&record).await?;
        }

        parent = apply_event(parent, DownloadEvent::Queued, now);
        self.store.save(&parent).await?;
        info!(
            artist = %artist.name,
            album = %album.title,
            files = handles.len(),
            session = %parent.id,
            "album session submitted"
        );
        Ok(parent)
    }

    /// Download a single library track
    pub async fn download_track(&self, artist_id: i64, track_id: i64) -> Result<DownloadRecord> {
        if !self.client.is_configured() {
            return Err(MuseSyncError::ServiceNotConfigured);
        }

        let artist = self.library.require_artist(artist_id).await?;
        let track = self
            .library
            .get_track(track_id)
            .await?
            .ok_or_else(|| MuseSyncError::RecordNotFound(format!("track {}", track_id)))?;
        if track.artist_id != artist_id {
            return Err(MuseSyncError::DataConsistency(format!(
                "track {} belongs to artist {}, not {}",
                track_id, track.artist_id, artist_id
            )));
        }

        let record =
            DownloadRecord::new_track(Some(artist_id), &artist.name, Some(track_id), &track.title);
        self.store.insert(&record).await?;

        self.submit_single(record, &artist.name, &track.title).await
    }

    /// Download a one-off discovery track that has no library identifiers yet
    pub async fn download_flow_track(
        &self,
        artist_name: &str,
        track_title: &str,
    ) -> Result<DownloadRecord> {
        if !self.client.is_configured() {
            return Err(MuseSyncError::ServiceNotConfigured);
        }

        let record = DownloadRecord::new_weekly_flow(artist_name, track_title);
        self.store.insert(&record).await?;

        self.submit_single(record, artist_name, track_title).await
    }

    /// Search for one track and attach the best handle to the record
    async fn submit_single(
        &self,
        record: DownloadRecord,
        artist_name: &str,
        track_title: &str,
    ) -> Result<DownloadRecord> {
        let query = SearchQuery {
            text: format!("{} {}", artist_name, track_title),
            tracks: vec![TrackCandidate {
                track_id: record.track_id,
                title: track_title.to_string(),
                position: record.track_position,
            }],
            exclude_usernames: record.tried_usernames.clone(),
        };

        let handles = match self.client.search_and_download(&query).await {
            Ok(handles) => handles,
            Err(e) => {
                let failure = Failure::from_error(&e);
                let category = classify_failure(&failure);
                self.fail_record(record, category, failure.message).await?;
                return Err(e);
            }
        };

        let Some(handle) = handles.first() else {
            let name = record.display_name();
            self.fail_record(
                record,
                ErrorCategory::NotFound,
                "no peer offered the requested file".to_string(),
            )
            .await?;
            return Err(MuseSyncError::NoCandidatesFound(name));
        };

        let mut record = record;
        adopt_handle(&mut record, handle);
        let record = apply_event(record, DownloadEvent::Queued, Utc::now());
        self.store.save(&record).await?;
        info!(name = %record.display_name(), peer = ?record.username, "track download queued");
        Ok(record)
    }

    // ========================================================================
    // POLL LOOP
    // ========================================================================

    /// One poll tick: reconcile every in-flight record against the
    /// service's download list. Overlapping ticks are skipped.
    pub async fn check_completed_downloads(&self) -> Result<()> {
        if self.poll_in_flight.swap(true, Ordering::SeqCst) {
            debug!("poll tick already running, skipping");
            return Ok(());
        }
        let result = self.poll_downloads().await;
        self.poll_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn poll_downloads(&self) -> Result<()> {
        let records = self.store.list_in_flight().await?;
        if records.is_empty() {
            return self.check_for_completed_albums().await;
        }

        let remote = self.client.get_downloads().await?;
        let mut claimed: HashSet<usize> = HashSet::new();

        for record in records {
            if record.is_parent {
                continue;
            }
            let outcome = if record.status == DownloadStatus::Failed {
                self.maybe_retry(record).await
            } else {
                match find_remote_entry(&record, &remote, &mut claimed) {
                    Some(idx) => self.handle_remote_state(record, &remote[idx]).await,
                    None => self.handle_unmatched(record).await,
                }
            };
            if let Err(e) = outcome {
                warn!(error = %e, "record reconciliation failed, continuing");
            }
        }

        self.check_for_completed_albums().await
    }

    /// Route a matched record by the remote entry's normalized state
    pub(super) async fn handle_remote_state(
        &self,
        mut record: DownloadRecord,
        entry: &RemoteDownload,
    ) -> Result<()> {
        // adopt an id discovered through deferred matching
        if record.external_id.is_none() && entry.id.is_some() {
            record.external_id = entry.id.clone();
        }

        match entry.state {
            RemoteState::Completed => self.handle_completed(record, entry).await,
            RemoteState::Failed => {
                let failure = Failure::new(format!("remote failure: {}", entry.raw_state), None);
                let category = classify_failure(&failure);
                self.fail_record(record, category, failure.message).await
            }
            RemoteState::Cancelled => {
                info!(name = %record.display_name(), "download cancelled remotely");
                let record = apply_event(record, DownloadEvent::Cancelled, Utc::now());
                self.store.save(&record).await
            }
            RemoteState::Downloading | RemoteState::Queued | RemoteState::Unknown => {
                self.update_progress(record, entry).await
            }
        }
    }

    /// Progress bookkeeping and stall detection for a still-running transfer.
    ///
    /// `last_checked` is the time of the last observed *progress* change;
    /// a raw-state change alone does not reset it, which is what lets the
    /// no-progress threshold fire on a flapping but frozen transfer.
    async fn update_progress(&self, mut record: DownloadRecord, entry: &RemoteDownload) -> Result<()> {
        let now = Utc::now();
        let new_progress = entry.progress();
        let state_changed = record.last_state.as_deref() != Some(entry.raw_state.as_str());
        let progress_changed = (new_progress - record.progress).abs() > f64::EPSILON;

        record.last_state = Some(entry.raw_state.clone());

        if record.status != DownloadStatus::Downloading && entry.state == RemoteState::Downloading {
            record = apply_event(
                record,
                DownloadEvent::Started {
                    username: Some(entry.username.clone()),
                    filename: Some(entry.filename.clone()),
                },
                now,
            );
        }

        if progress_changed {
            let record = apply_event(
                record,
                DownloadEvent::Progress {
                    progress: new_progress,
                },
                now,
            );
            return self.store.save(&record).await;
        }

        let reference = record.last_checked.unwrap_or(record.created_at);
        let idle = (now - reference).to_std().unwrap_or(Duration::ZERO);
        let threshold = if state_changed {
            self.config.stall_no_progress()
        } else {
            self.config.stall_no_change()
        };

        if idle < threshold {
            return self.store.save(&record).await;
        }

        if record.stall_retries < self.config.max_stall_retries as i32 {
            warn!(
                name = %record.display_name(),
                idle_secs = idle.as_secs(),
                "download stalled, resubmitting"
            );
            let record = apply_event(record, DownloadEvent::Stalled, now);
            self.cancel_remote(&record).await;
            self.resubmit(record).await
        } else {
            warn!(name = %record.display_name(), "stall retries exhausted");
            let record = apply_event(record, DownloadEvent::TimedOut, now);
            self.store.save(&record).await
        }
    }

    /// A record the service no longer lists: give it time, retry once it is
    /// overdue, give up past the timeout.
    async fn handle_unmatched(&self, record: DownloadRecord) -> Result<()> {
        let now = Utc::now();
        let basis = match record.last_requeue_at {
            Some(requeued) => requeued.max(record.created_at),
            None => record.created_at,
        };
        let age = (now - basis).to_std().unwrap_or(Duration::ZERO);

        if age >= self.config.unmatched_timeout() {
            warn!(name = %record.display_name(), "no matching remote entry, timing out");
            self.cancel_remote(&record).await;
            let record = apply_event(record, DownloadEvent::TimedOut, now);
            self.store.save(&record).await
        } else if age >= self.config.unmatched_retry() {
            info!(name = %record.display_name(), "no matching remote entry, resubmitting");
            self.cancel_remote(&record).await;
            self.resubmit(record).await
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // FAILURES AND RETRIES
    // ========================================================================

    /// Record a classified failure. The retry itself happens later, once
    /// the poll loop finds the backoff elapsed.
    pub(super) async fn fail_record(
        &self,
        record: DownloadRecord,
        category: ErrorCategory,
        message: String,
    ) -> Result<()> {
        warn!(
            name = %record.display_name(),
            category = category.as_str(),
            message = %message,
            "download failed"
        );
        let record = apply_event(
            record,
            DownloadEvent::Failed {
                error_type: category.as_str().to_string(),
                message,
            },
            Utc::now(),
        );
        self.store.save(&record).await
    }

    /// Retry a failed record if its category still has budget and the
    /// backoff has elapsed
    async fn maybe_retry(&self, record: DownloadRecord) -> Result<()> {
        let category = record
            .error_type
            .as_deref()
            .map(ErrorCategory::from_str)
            .unwrap_or(ErrorCategory::Unknown);
        if category.is_terminal() {
            return Ok(());
        }
        let policy = RetryPolicy::for_category(category);
        let attempt = record.retry_count.max(0) as u32;
        if !policy.is_retry_due(attempt, record.last_failure_at, Utc::now()) {
            return Ok(());
        }

        info!(
            name = %record.display_name(),
            category = category.as_str(),
            attempt,
            "backoff elapsed, retrying"
        );
        self.cancel_remote(&record).await;
        self.resubmit(record).await
    }

    /// Submit a fresh attempt for a leaf record, excluding peers already
    /// tried. Parents are never resubmitted directly.
    pub(super) async fn resubmit(&self, record: DownloadRecord) -> Result<()> {
        if record.is_parent {
            return Ok(());
        }

        let mut record = apply_event(record, DownloadEvent::Requeued, Utc::now());
        // persist the cleared attempt before touching the service
        self.store.save(&record).await?;

        let Some(text) = search_text(&record) else {
            return self
                .fail_record(
                    record,
                    ErrorCategory::Permanent,
                    "record carries no searchable names".to_string(),
                )
                .await;
        };

        let query = SearchQuery {
            text,
            tracks: candidate_for(&record).into_iter().collect(),
            exclude_usernames: record.tried_usernames.clone(),
        };

        match self.client.search_and_download(&query).await {
            Ok(handles) => match handles.first() {
                Some(handle) => {
                    adopt_handle(&mut record, handle);
                    let record = apply_event(record, DownloadEvent::Queued, Utc::now());
                    self.store.save(&record).await
                }
                None => {
                    self.fail_record(
                        record,
                        ErrorCategory::NotFound,
                        "no peer offered the requested file".to_string(),
                    )
                    .await
                }
            },
            Err(e) => {
                let failure = Failure::from_error(&e);
                let category = classify_failure(&failure);
                self.fail_record(record, category, failure.message).await
            }
        }
    }

    /// The requeue sweep: failed records old enough, spaced out enough, and
    /// not yet handled by the downstream queue cleaner get a fresh attempt.
    pub async fn check_failed_downloads_for_requeue(&self) -> Result<()> {
        let failed = self.store.list_by_status(DownloadStatus::Failed).await?;
        let now = Utc::now();

        for record in failed {
            if record.stale || record.queue_cleaned || record.is_parent {
                continue;
            }
            if record.retry_count >= self.config.max_requeue_retries as i32 {
                continue;
            }
            let Some(failed_at) = record.last_failure_at else {
                continue;
            };
            let failure_age = (now - failed_at).to_std().unwrap_or(Duration::ZERO);
            if failure_age < self.config.requeue_min_failure_age() {
                continue;
            }
            if let Some(requeued_at) = record.last_requeue_at {
                let spacing = (now - requeued_at).to_std().unwrap_or(Duration::ZERO);
                if spacing < self.config.requeue_spacing() {
                    continue;
                }
            }

            info!(name = %record.display_name(), "requeue sweep resubmitting");
            if let Err(e) = self.resubmit(record).await {
                warn!(error = %e, "requeue attempt failed, continuing");
            }
        }
        Ok(())
    }

    pub(super) async fn cancel_remote(&self, record: &DownloadRecord) {
        if let Some(id) = &record.external_id {
            if let Err(e) = self.client.cancel_download(id).await {
                debug!(id = %id, error = %e, "remote cancel failed");
            }
        }
    }

    // ========================================================================
    // COMPLETION
    // ========================================================================

    /// A transfer the service reports finished: locate the file locally,
    /// then either import it directly (tracks) or park it for the album
    /// session (album tracks).
    pub(super) async fn handle_completed(
        &self,
        mut record: DownloadRecord,
        entry: &RemoteDownload,
    ) -> Result<()> {
        if record.status == DownloadStatus::Added {
            return Ok(());
        }
        let now = Utc::now();

        let direct_path = self.direct_path_for(&record).await;
        if let Some(path) = &direct_path {
            record.remote_file_path = Some(path.display().to_string());
        }

        let remote_filename = record
            .filename
            .clone()
            .unwrap_or_else(|| entry.filename.clone());
        let username = record
            .username
            .clone()
            .or_else(|| (!entry.username.is_empty()).then(|| entry.username.clone()));

        let extra_roots = self.service_roots().await;
        let resolved = match self
            .resolver
            .resolve(
                &remote_filename,
                username.as_deref(),
                direct_path.as_deref(),
                &extra_roots,
            )
            .await
        {
            Ok(path) => path,
            Err(e) => {
                // not retried automatically; the record stays visible for
                // operators and later ticks
                warn!(name = %record.display_name(), error = %e, "finished download not found on disk");
                let record =
                    apply_event(record, DownloadEvent::Completed { temp_file_path: None }, now);
                return self.store.save(&record).await;
            }
        };

        match record.kind {
            DownloadKind::Track | DownloadKind::WeeklyFlow => {
                self.import_single_track(record, &resolved).await
            }
            DownloadKind::Album => {
                let record = apply_event(
                    record,
                    DownloadEvent::Completed {
                        temp_file_path: Some(resolved.display().to_string()),
                    },
                    now,
                );
                self.store.save(&record).await?;
                self.evaluate_album_session(&record).await
            }
        }
    }

    /// Move a standalone track straight into the library
    pub(super) async fn import_single_track(&self, record: DownloadRecord, source: &Path) -> Result<()> {
        let now = Utc::now();
        let mut record = apply_event(
            record,
            DownloadEvent::Completed {
                temp_file_path: Some(source.display().to_string()),
            },
            now,
        );
        self.store.save(&record).await?;

        let destination = self.track_destination(&record, source);
        match self.relocator.relocate(source, &destination).await {
            Ok(final_path) => {
                record = apply_event(
                    record,
                    DownloadEvent::Moved {
                        destination_path: final_path.display().to_string(),
                    },
                    now,
                );

                if let Some(track_id) = record.track_id {
                    self.library.set_track_file(track_id, &final_path).await?;
                } else if let (Some(matcher), Some(artist_id)) =
                    (&self.file_matcher, record.artist_id)
                {
                    if let Err(e) = matcher.match_file_to_track(&final_path, artist_id).await {
                        debug!(error = %e, "file matcher declined the import");
                    }
                }

                let track_id = record.track_id;
                record = apply_event(record, DownloadEvent::AddedToLibrary { track_id }, now);
                self.store.save(&record).await?;

                if let Some(album_id) = record.album_id {
                    self.library.update_album_statistics(album_id).await?;
                }
                if let Some(artist_id) = record.artist_id {
                    self.library.update_artist_statistics(artist_id).await?;
                }
                info!(name = %record.display_name(), path = %final_path.display(), "track imported");
                Ok(())
            }
            Err(e) => {
                // temp path stays set so a later tick retries the move
                warn!(name = %record.display_name(), error = %e, "move into library failed");
                self.store.save(&record).await
            }
        }
    }

    // ========================================================================
    // ALBUM SESSIONS
    // ========================================================================

    /// All-or-nothing import check for the session a record belongs to.
    /// Runs the import when every track of the session has a file and none
    /// has failed; otherwise leaves everything parked.
    pub(super) async fn evaluate_album_session(&self, record: &DownloadRecord) -> Result<()> {
        let Some(album_id) = record.album_id else {
            return Ok(());
        };

        let session_id = match &record.session_id {
            Some(id) => id.clone(),
            None => match self.fallback_session_id(album_id).await? {
                Some(id) => id,
                None => return Ok(()),
            },
        };

        let tracks = self.store.list_session_tracks(&session_id).await?;
        if tracks.is_empty() {
            return Ok(());
        }

        let failed = tracks
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    DownloadStatus::Failed | DownloadStatus::Timeout | DownloadStatus::Cancelled
                )
            })
            .count();
        let finished = tracks
            .iter()
            .filter(|t| t.status == DownloadStatus::Added || t.has_pending_file())
            .count();

        if failed > 0 || finished < tracks.len() {
            debug!(
                session = %session_id,
                finished,
                failed,
                total = tracks.len(),
                "album session not ready for import"
            );
            return Ok(());
        }

        self.import_album_session(album_id, &session_id, tracks).await
    }

    async fn import_album_session(
        &self,
        album_id: i64,
        session_id: &str,
        tracks: Vec<DownloadRecord>,
    ) -> Result<()> {
        let now = Utc::now();
        let artist_name = tracks
            .iter()
            .find_map(|t| t.artist_name.clone())
            .unwrap_or_else(|| "Unsorted".to_string());
        let album_name = tracks
            .iter()
            .find_map(|t| t.album_name.clone())
            .unwrap_or_else(|| "Unknown Album".to_string());
        let album_dir = self.album_directory(&artist_name, &album_name);
        let library_tracks = self.library.list_album_tracks(album_id).await?;

        for track in tracks {
            if track.status == DownloadStatus::Added {
                continue;
            }
            let Some(temp) = track.temp_file_path.clone() else {
                // resolution has not caught up yet; try again next tick
                debug!(session = %session_id, name = %track.display_name(), "track has no local file yet");
                return Ok(());
            };
            let source = PathBuf::from(&temp);
            let destination = album_dir.join(sanitize_component(&basename(
                source
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(&temp),
            )));

            let final_path = match self.relocator.relocate(&source, &destination).await {
                Ok(path) => path,
                Err(e) => {
                    // abort the pass; temp files stay parked for a retry
                    warn!(session = %session_id, error = %e, "album import move failed");
                    return Ok(());
                }
            };

            let mut track = apply_event(
                track,
                DownloadEvent::Moved {
                    destination_path: final_path.display().to_string(),
                },
                now,
            );

            let matched = match track.track_id {
                Some(id) => library_tracks.iter().find(|t| t.track_id == id),
                None => {
                    let file_name = final_path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default();
                    match_library_track(file_name, &library_tracks)
                }
            };

            match matched {
                Some(library_track) => {
                    self.library
                        .set_track_file(library_track.track_id, &final_path)
                        .await?;
                    track = apply_event(
                        track,
                        DownloadEvent::AddedToLibrary {
                            track_id: Some(library_track.track_id),
                        },
                        now,
                    );
                }
                None => {
                    if let (Some(matcher), Some(artist_id)) = (&self.file_matcher, track.artist_id)
                    {
                        if let Err(e) = matcher.match_file_to_track(&final_path, artist_id).await {
                            debug!(error = %e, "file matcher declined the import");
                        }
                    }
                    track = apply_event(track, DownloadEvent::AddedToLibrary { track_id: None }, now);
                }
            }
            self.store.save(&track).await?;
        }

        self.library.set_album_path(album_id, &album_dir).await?;
        self.library.update_album_statistics(album_id).await?;
        self.library
            .set_album_request_status(album_id, "available")
            .await?;
        if let Some(artist_id) = library_tracks.first().map(|t| t.artist_id) {
            self.library.update_artist_statistics(artist_id).await?;
        }

        if let Some(parent) = self.store.get(session_id).await? {
            if parent.is_parent && parent.status != DownloadStatus::Added {
                let parent = apply_event(parent, DownloadEvent::AddedToLibrary { track_id: None }, now);
                self.store.save(&parent).await?;
            }
        }

        info!(album = %album_name, path = %album_dir.display(), "album session imported");
        Ok(())
    }

    /// Safety-net sweep: album tracks whose files are parked but whose
    /// session evaluation never ran (crash between save and evaluate)
    pub async fn check_for_completed_albums(&self) -> Result<()> {
        let completed = self.store.list_by_status(DownloadStatus::Completed).await?;
        let mut seen: HashSet<String> = HashSet::new();

        for record in completed {
            if record.kind != DownloadKind::Album || record.is_parent || record.stale {
                continue;
            }
            let key = record
                .session_id
                .clone()
                .unwrap_or_else(|| record.id.clone());
            if !seen.insert(key) {
                continue;
            }
            if let Err(e) = self.evaluate_album_session(&record).await {
                warn!(error = %e, "album sweep evaluation failed, continuing");
            }
        }
        Ok(())
    }

    /// Prefer the newest active session; fall back to the newest session of
    /// any state when no active one remains.
    async fn fallback_session_id(&self, album_id: i64) -> Result<Option<String>> {
        let session = match self.store.latest_session_for_album(album_id, true).await? {
            Some(session) => Some(session),
            None => self.store.latest_session_for_album(album_id, false).await?,
        };
        Ok(session.map(|s| s.session_id.unwrap_or(s.id)))
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// The album's newest non-stale session, but only while it is still
    /// progressing and at least one track holds a live service transfer.
    /// Such a session must be handed back instead of superseded.
    async fn active_session_with_downloads(
        &self,
        album_id: i64,
    ) -> Result<Option<DownloadRecord>> {
        let Some(existing) = self.store.latest_session_for_album(album_id, true).await? else {
            return Ok(None);
        };
        if !existing.is_active() {
            return Ok(None);
        }
        let session_id = existing.session_id.clone().unwrap_or_else(|| existing.id.clone());
        let children = self.store.list_session_tracks(&session_id).await?;
        if children.iter().any(|c| c.is_active() && c.external_id.is_some()) {
            Ok(Some(existing))
        } else {
            Ok(None)
        }
    }

    /// Three independent checks, cheapest first: library flags, files in
    /// the album folder, destinations recorded by earlier sessions.
    async fn album_already_complete(
        &self,
        artist: &Artist,
        album: &Album,
        tracks: &[Track],
    ) -> Result<bool> {
        if !tracks.is_empty() && tracks.iter().all(|t| t.has_file) {
            return Ok(true);
        }

        if album.track_count > 0 {
            let album_dir = album
                .path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.album_directory(&artist.name, &album.title));
            let on_disk = count_audio_files(&album_dir).await;
            if on_disk >= album.track_count as usize {
                return Ok(true);
            }

            let prior = self.store.list_for_album(album.album_id).await?;
            let mut destinations: HashSet<String> = HashSet::new();
            for record in prior {
                if let Some(dest) = record.destination_path {
                    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                        destinations.insert(dest);
                    }
                }
            }
            if destinations.len() >= album.track_count as usize {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn synthetic_completed_session(
        &self,
        artist: &Artist,
        album: &Album,
    ) -> Result<DownloadRecord> {
        let record = DownloadRecord::new_album_session(
            artist.artist_id,
            &artist.name,
            album.album_id,
            &album.title,
        );
        let record = apply_event(
            record,
            DownloadEvent::Completed {
                temp_file_path: None,
            },
            Utc::now(),
        );
        self.store.insert(&record).await?;
        Ok(record)
    }

    /// Tracklist for candidate matching: local tracks when present, a
    /// best-effort external lookup otherwise. Lookup trouble degrades to an
    /// empty list rather than blocking the download.
    async fn tracklist_candidates(
        &self,
        artist: &Artist,
        album: &Album,
        tracks: &[Track],
    ) -> Vec<TrackCandidate> {
        if !tracks.is_empty() {
            return tracks
                .iter()
                .map(|t| TrackCandidate {
                    track_id: Some(t.track_id),
                    title: t.title.clone(),
                    position: Some(t.position),
                })
                .collect();
        }

        let Some(metadata) = &self.metadata else {
            return Vec::new();
        };
        match tokio::time::timeout(
            self.config.metadata_timeout(),
            metadata.album_tracklist(&artist.name, &album.title),
        )
        .await
        {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                debug!(error = %e, "tracklist lookup failed, downloading without one");
                Vec::new()
            }
            Err(_) => {
                debug!(
                    album = %album.title,
                    "tracklist lookup timed out, downloading without one"
                );
                Vec::new()
            }
        }
    }

    async fn direct_path_for(&self, record: &DownloadRecord) -> Option<PathBuf> {
        let id = record.external_id.as_ref()?;
        match self.client.get_download(id).await {
            Ok(detail) => detail.and_then(|d| d.direct_path),
            Err(e) => {
                debug!(id = %id, error = %e, "detail lookup failed");
                None
            }
        }
    }

    /// Download roots learned from the service itself, on top of the
    /// configured ones. Fetched once per process.
    pub(super) async fn service_roots(&self) -> Vec<PathBuf> {
        match self
            .download_dir
            .get_or_try_init(|| self.client.download_directory())
            .await
        {
            Ok(dir) => vec![self.config.map_remote_path(dir)],
            Err(e) => {
                debug!(error = %e, "service download directory unavailable");
                Vec::new()
            }
        }
    }

    pub(super) fn album_directory(&self, artist_name: &str, album_name: &str) -> PathBuf {
        self.config
            .library_dir
            .join(sanitize_component(artist_name))
            .join(sanitize_component(album_name))
    }

    pub(super) fn track_destination(&self, record: &DownloadRecord, source: &Path) -> PathBuf {
        let artist = record.artist_name.as_deref().unwrap_or("Unsorted");
        let source_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(basename)
            .unwrap_or_else(|| "download".to_string());
        self.config
            .library_dir
            .join(sanitize_component(artist))
            .join(sanitize_component(&source_name))
    }
}

// ============================================================================
// MATCHING
// ============================================================================

/// Copy the service's answer onto a record and remember the peer
fn adopt_handle(record: &mut DownloadRecord, handle: &DownloadHandle) {
    record.external_id = handle.id.clone();
    record.filename = Some(handle.filename.clone());
    record.username = Some(handle.username.clone());
    record.mark_username_tried(&handle.username);
}

/// Locate a record's remote entry: by external id first, then by deferred
/// identity matching for records the service never handed an id. Each
/// remote entry is claimed at most once per tick.
fn find_remote_entry(
    record: &DownloadRecord,
    remote: &[RemoteDownload],
    claimed: &mut HashSet<usize>,
) -> Option<usize> {
    if let Some(external_id) = &record.external_id {
        let found = remote
            .iter()
            .enumerate()
            .position(|(idx, entry)| {
                !claimed.contains(&idx) && entry.id.as_deref() == Some(external_id.as_str())
            });
        if let Some(idx) = found {
            claimed.insert(idx);
            return Some(idx);
        }
        return None;
    }

    let found = remote
        .iter()
        .enumerate()
        .position(|(idx, entry)| !claimed.contains(&idx) && matches_deferred(record, entry));
    if let Some(idx) = found {
        claimed.insert(idx);
    }
    found
}

/// Identity matching for records without an external id, strictest tier
/// first: known filename, artist and title both in the filename, title
/// word-set in the filename with the artist in the filename or peer name.
pub(super) fn matches_deferred(record: &DownloadRecord, entry: &RemoteDownload) -> bool {
    let entry_file = entry.filename.to_lowercase();

    if let Some(filename) = &record.filename {
        let known = filename.to_lowercase();
        if entry_file == known || entry_file.contains(&known) || known.contains(&entry_file) {
            return true;
        }
    }

    let Some(title) = record.track_title.as_deref().or(record.album_name.as_deref()) else {
        return false;
    };
    let title = title.to_lowercase();
    let artist = record.artist_name.as_deref().unwrap_or("").to_lowercase();

    if !artist.is_empty() && entry_file.contains(&artist) && entry_file.contains(&title) {
        return true;
    }

    let file_words: HashSet<String> = tokenize(&entry_file).into_iter().collect();
    let title_words = tokenize(&title);
    if title_words.is_empty() || !title_words.iter().all(|w| file_words.contains(w)) {
        return false;
    }
    let peer = entry.username.to_lowercase();
    !artist.is_empty() && (entry_file.contains(&artist) || peer.contains(&artist))
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

/// Match a search candidate to a returned filename by title
fn match_candidate(filename: &str, candidates: &[TrackCandidate]) -> Option<TrackCandidate> {
    let lower = filename.to_lowercase();
    candidates
        .iter()
        .find(|c| lower.contains(&c.title.to_lowercase()))
        .cloned()
}

/// Match an imported file back to a library track: exact title, title
/// substring, then leading track number.
fn match_library_track<'a>(file_name: &str, tracks: &'a [Track]) -> Option<&'a Track> {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name)
        .to_lowercase();

    if let Some(track) = tracks.iter().find(|t| t.title.to_lowercase() == stem) {
        return Some(track);
    }
    if let Some(track) = tracks
        .iter()
        .find(|t| !t.title.is_empty() && stem.contains(&t.title.to_lowercase()))
    {
        return Some(track);
    }

    let number: i64 = stem
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    tracks.iter().find(|t| t.position == number)
}

fn search_text(record: &DownloadRecord) -> Option<String> {
    let artist = record.artist_name.as_deref()?;
    let subject = record
        .track_title
        .as_deref()
        .or(record.album_name.as_deref())?;
    Some(format!("{} {}", artist, subject))
}

fn candidate_for(record: &DownloadRecord) -> Option<TrackCandidate> {
    record.track_title.as_ref().map(|title| TrackCandidate {
        track_id: record.track_id,
        title: title.clone(),
        position: record.track_position,
    })
}
