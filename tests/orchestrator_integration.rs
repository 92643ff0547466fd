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

//! End-to-end orchestrator tests against an in-memory database, temp
//! directories, and a scripted mock of the download service.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use musesync::config::DownloadConfig;
use musesync::download::events::{apply_event, DownloadEvent};
use musesync::download::{DownloadOrchestrator, DownloadQueue};
use musesync::error::{MuseSyncError, Result};
use musesync::slskd::types::normalize_state;
use musesync::slskd::{
    DownloadClient, DownloadHandle, RemoteDownload, RemoteDownloadDetail, SearchQuery,
};
use musesync::storage::database::Database;
use musesync::storage::library::LibraryStore;
use musesync::storage::records::{DownloadRecord, DownloadStatus, DownloadStore};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::fs;

// ============================================================================
// MOCK SERVICE
// ============================================================================

struct MockClient {
    configured: bool,
    download_dir: PathBuf,
    /// Scripted answers for successive search_and_download calls; an empty
    /// queue answers with no handles
    search_results: Mutex<VecDeque<Vec<DownloadHandle>>>,
    searches: Mutex<Vec<SearchQuery>>,
    downloads: Mutex<Vec<RemoteDownload>>,
    cancelled: Mutex<Vec<String>>,
    download_fetches: AtomicUsize,
}

impl MockClient {
    fn new(download_dir: PathBuf) -> Self {
        Self {
            configured: true,
            download_dir,
            search_results: Mutex::new(VecDeque::new()),
            searches: Mutex::new(Vec::new()),
            downloads: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            download_fetches: AtomicUsize::new(0),
        }
    }

    fn script_search(&self, handles: Vec<DownloadHandle>) {
        self.search_results.lock().unwrap().push_back(handles);
    }

    fn set_downloads(&self, downloads: Vec<RemoteDownload>) {
        *self.downloads.lock().unwrap() = downloads;
    }

    fn search_count(&self) -> usize {
        self.searches.lock().unwrap().len()
    }

    fn last_search(&self) -> SearchQuery {
        self.searches.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl DownloadClient for MockClient {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn search_and_download(&self, query: &SearchQuery) -> Result<Vec<DownloadHandle>> {
        self.searches.lock().unwrap().push(query.clone());
        Ok(self
            .search_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn get_downloads(&self) -> Result<Vec<RemoteDownload>> {
        self.download_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.downloads.lock().unwrap().clone())
    }

    async fn get_download(&self, _id: &str) -> Result<Option<RemoteDownloadDetail>> {
        Ok(None)
    }

    async fn cancel_download(&self, id: &str) -> Result<()> {
        self.cancelled.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn download_directory(&self) -> Result<PathBuf> {
        Ok(self.download_dir.clone())
    }
}

#[derive(Default)]
struct RecordingQueue {
    enqueued: Mutex<Vec<String>>,
}

impl DownloadQueue for RecordingQueue {
    fn enqueue(&self, record: &DownloadRecord) -> Result<()> {
        self.enqueued.lock().unwrap().push(record.id.clone());
        Ok(())
    }
}

// ============================================================================
// HARNESS
// ============================================================================

struct Harness {
    _tmp: TempDir,
    config: DownloadConfig,
    client: Arc<MockClient>,
    queue: Arc<RecordingQueue>,
    orchestrator: DownloadOrchestrator,
    store: DownloadStore,
    library: LibraryStore,
}

async fn harness() -> Harness {
    let tmp = TempDir::new().unwrap();
    let config = DownloadConfig {
        complete_dir: tmp.path().join("complete"),
        incomplete_dir: tmp.path().join("incomplete"),
        library_dir: tmp.path().join("library"),
        ..Default::default()
    };
    fs::create_dir_all(&config.complete_dir).await.unwrap();
    fs::create_dir_all(&config.incomplete_dir).await.unwrap();
    fs::create_dir_all(&config.library_dir).await.unwrap();

    let db = Database::new_in_memory().await.unwrap();
    let store = DownloadStore::new(db.pool().clone());
    let library = LibraryStore::new(db.pool().clone());
    let client = Arc::new(MockClient::new(config.complete_dir.clone()));
    let queue = Arc::new(RecordingQueue::default());

    let orchestrator = DownloadOrchestrator::new(
        config.clone(),
        store.clone(),
        library.clone(),
        client.clone(),
    )
    .with_queue(queue.clone());

    Harness {
        _tmp: tmp,
        config,
        client,
        queue,
        orchestrator,
        store,
        library,
    }
}

/// Seed one artist with one two-track album, returning (artist, album, track ids)
async fn seed_album(library: &LibraryStore) -> (i64, i64, Vec<i64>) {
    let artist_id = library.insert_artist("Nils Frahm").await.unwrap();
    let album_id = library.insert_album(artist_id, "Spaces", Some(2013)).await.unwrap();
    let t1 = library.insert_track(album_id, artist_id, "Says", 1).await.unwrap();
    let t2 = library.insert_track(album_id, artist_id, "Hammers", 2).await.unwrap();
    (artist_id, album_id, vec![t1, t2])
}

fn handle(id: &str, username: &str, filename: &str) -> DownloadHandle {
    DownloadHandle {
        id: Some(id.to_string()),
        username: username.to_string(),
        filename: filename.to_string(),
        size: 1_000_000,
        track: None,
    }
}

fn remote(id: &str, username: &str, filename: &str, raw_state: &str, progress: f64) -> RemoteDownload {
    RemoteDownload {
        id: Some(id.to_string()),
        username: username.to_string(),
        filename: filename.to_string(),
        size: 1_000_000,
        bytes_transferred: (1_000_000.0 * progress / 100.0) as i64,
        percent_complete: progress,
        raw_state: raw_state.to_string(),
        state: normalize_state(raw_state),
    }
}

async fn place_file(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.unwrap();
    }
    fs::write(path, b"pcm data").await.unwrap();
}

// ============================================================================
// SUBMISSION
// ============================================================================

#[tokio::test]
async fn test_queue_album_download_records_and_enqueues() {
    let h = harness().await;
    let (artist_id, album_id, _) = seed_album(&h.library).await;

    let record = h
        .orchestrator
        .queue_album_download(artist_id, album_id)
        .await
        .unwrap();

    assert_eq!(record.status, DownloadStatus::Requested);
    assert!(record.is_parent);
    assert_eq!(record.session_id.as_deref(), Some(record.id.as_str()));
    assert_eq!(h.queue.enqueued.lock().unwrap().clone(), vec![record.id.clone()]);
    // nothing touched the external service yet
    assert_eq!(h.client.search_count(), 0);
}

#[tokio::test]
async fn test_queue_album_download_short_circuits_complete_album() {
    let h = harness().await;
    let (artist_id, album_id, tracks) = seed_album(&h.library).await;
    for track_id in &tracks {
        let path = h.config.library_dir.join(format!("{track_id}.flac"));
        place_file(&path).await;
        h.library.set_track_file(*track_id, &path).await.unwrap();
    }

    let record = h
        .orchestrator
        .queue_album_download(artist_id, album_id)
        .await
        .unwrap();

    assert_eq!(record.status, DownloadStatus::Completed);
    assert!(h.queue.enqueued.lock().unwrap().is_empty());
    assert_eq!(h.client.search_count(), 0);
}

#[tokio::test]
async fn test_queue_album_download_returns_active_session_with_transfers() {
    let h = harness().await;
    let (artist_id, album_id, _) = seed_album(&h.library).await;

    h.client.script_search(vec![
        handle("t-1", "goodpeer", r"Music\Nils Frahm\Spaces\01 - Says.flac"),
        handle("t-2", "goodpeer", r"Music\Nils Frahm\Spaces\02 - Hammers.flac"),
    ]);

    let first = h
        .orchestrator
        .queue_album_download(artist_id, album_id)
        .await
        .unwrap();
    h.orchestrator
        .download_album(artist_id, album_id, Some(&first.id))
        .await
        .unwrap();

    // asking again while the transfers run must hand back the same session
    let second = h
        .orchestrator
        .queue_album_download(artist_id, album_id)
        .await
        .unwrap();
    assert_eq!(second.session_id, first.session_id);

    let original = h.store.get(&first.id).await.unwrap().unwrap();
    assert!(!original.stale, "in-flight session must not be superseded");
    let children = h
        .store
        .list_session_tracks(first.session_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| !c.stale && c.external_id.is_some()));

    // only the first request reached the work queue or the service
    assert_eq!(h.queue.enqueued.lock().unwrap().clone(), vec![first.id.clone()]);
    assert_eq!(h.client.search_count(), 1);
}

#[tokio::test]
async fn test_download_album_creates_session_records() {
    let h = harness().await;
    let (artist_id, album_id, _) = seed_album(&h.library).await;

    h.client.script_search(vec![
        handle("t-1", "goodpeer", r"Music\Nils Frahm\Spaces\01 - Says.flac"),
        handle("t-2", "goodpeer", r"Music\Nils Frahm\Spaces\02 - Hammers.flac"),
    ]);

    let parent = h
        .orchestrator
        .download_album(artist_id, album_id, None)
        .await
        .unwrap();

    assert_eq!(parent.status, DownloadStatus::Queued);
    assert_eq!(h.client.last_search().text, "Nils Frahm Spaces");

    let children = h
        .store
        .list_session_tracks(parent.session_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    for child in &children {
        assert_eq!(child.status, DownloadStatus::Queued);
        assert!(child.external_id.is_some());
        assert_eq!(child.username.as_deref(), Some("goodpeer"));
        assert!(child.track_id.is_some(), "candidate matching should link tracks");
    }
}

#[tokio::test]
async fn test_download_album_rejects_mismatched_artist() {
    let h = harness().await;
    let (_, album_id, _) = seed_album(&h.library).await;
    let other_artist = h.library.insert_artist("Someone Else").await.unwrap();

    let err = h
        .orchestrator
        .download_album(other_artist, album_id, None)
        .await;
    assert!(matches!(err, Err(MuseSyncError::DataConsistency(_))));
    assert_eq!(h.client.search_count(), 0);
}

#[tokio::test]
async fn test_download_album_no_results_fails_session() {
    let h = harness().await;
    let (artist_id, album_id, _) = seed_album(&h.library).await;
    // nothing scripted: the search answers with zero handles

    let parent = h
        .orchestrator
        .queue_album_download(artist_id, album_id)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .download_album(artist_id, album_id, Some(&parent.id))
        .await;
    assert!(matches!(err, Err(MuseSyncError::NoCandidatesFound(_))));

    let parent = h.store.get(&parent.id).await.unwrap().unwrap();
    assert_eq!(parent.status, DownloadStatus::Failed);
    assert_eq!(parent.error_type.as_deref(), Some("not_found"));
}

// ============================================================================
// POLL LOOP
// ============================================================================

#[tokio::test]
async fn test_album_happy_path_all_or_nothing_import() {
    let h = harness().await;
    let (artist_id, album_id, track_ids) = seed_album(&h.library).await;

    h.client.script_search(vec![
        handle("t-1", "goodpeer", r"Music\Nils Frahm\Spaces\01 - Says.flac"),
        handle("t-2", "goodpeer", r"Music\Nils Frahm\Spaces\02 - Hammers.flac"),
    ]);
    let parent = h
        .orchestrator
        .download_album(artist_id, album_id, None)
        .await
        .unwrap();

    // both transfers finish; files land under the peer folder
    place_file(&h.config.complete_dir.join("goodpeer/01 - Says.flac")).await;
    place_file(&h.config.complete_dir.join("goodpeer/02 - Hammers.flac")).await;
    h.client.set_downloads(vec![
        remote("t-1", "goodpeer", r"Music\Nils Frahm\Spaces\01 - Says.flac", "Completed, Succeeded", 100.0),
        remote("t-2", "goodpeer", r"Music\Nils Frahm\Spaces\02 - Hammers.flac", "Completed, Succeeded", 100.0),
    ]);

    h.orchestrator.check_completed_downloads().await.unwrap();

    let album_dir = h.config.library_dir.join("Nils Frahm/Spaces");
    assert!(album_dir.join("01 - Says.flac").exists());
    assert!(album_dir.join("02 - Hammers.flac").exists());
    // downloads cleaned up
    assert!(!h.config.complete_dir.join("goodpeer").exists());

    let children = h
        .store
        .list_session_tracks(parent.session_id.as_deref().unwrap())
        .await
        .unwrap();
    for child in &children {
        assert_eq!(child.status, DownloadStatus::Added);
        assert!(child.temp_file_path.is_none());
        assert!(child.destination_path.is_some());
    }
    let parent = h.store.get(&parent.id).await.unwrap().unwrap();
    assert_eq!(parent.status, DownloadStatus::Added);

    let album = h.library.get_album(album_id).await.unwrap().unwrap();
    assert_eq!(album.request_status, "available");
    for track_id in track_ids {
        let track = h.library.get_track(track_id).await.unwrap().unwrap();
        assert!(track.has_file);
    }
}

#[tokio::test]
async fn test_partial_album_blocks_import() {
    let h = harness().await;
    let (artist_id, album_id, _) = seed_album(&h.library).await;

    h.client.script_search(vec![
        handle("t-1", "goodpeer", r"Music\Nils Frahm\Spaces\01 - Says.flac"),
        handle("t-2", "goodpeer", r"Music\Nils Frahm\Spaces\02 - Hammers.flac"),
    ]);
    let parent = h
        .orchestrator
        .download_album(artist_id, album_id, None)
        .await
        .unwrap();

    place_file(&h.config.complete_dir.join("goodpeer/01 - Says.flac")).await;
    h.client.set_downloads(vec![
        remote("t-1", "goodpeer", r"Music\Nils Frahm\Spaces\01 - Says.flac", "Completed, Succeeded", 100.0),
        // ordered normalization: "Completed, Errored" is a failure
        remote("t-2", "goodpeer", r"Music\Nils Frahm\Spaces\02 - Hammers.flac", "Completed, Errored", 80.0),
    ]);

    h.orchestrator.check_completed_downloads().await.unwrap();

    // finished file stays parked, nothing reaches the library
    assert!(h.config.complete_dir.join("goodpeer/01 - Says.flac").exists());
    assert!(!h.config.library_dir.join("Nils Frahm/Spaces").exists());

    let children = h
        .store
        .list_session_tracks(parent.session_id.as_deref().unwrap())
        .await
        .unwrap();
    let says = children.iter().find(|c| c.external_id.as_deref() == Some("t-1")).unwrap();
    assert_eq!(says.status, DownloadStatus::Completed);
    assert!(says.temp_file_path.is_some());

    let hammers = children.iter().find(|c| c.external_id.as_deref() == Some("t-2")).unwrap();
    assert_eq!(hammers.status, DownloadStatus::Failed);
    assert_eq!(hammers.error_type.as_deref(), Some("unknown"));
    assert_eq!(hammers.retry_count, 1);

    let album = h.library.get_album(album_id).await.unwrap().unwrap();
    assert_eq!(album.request_status, "wanted");
}

#[tokio::test]
async fn test_progress_updates_and_started_event() {
    let h = harness().await;
    let (artist_id, album_id, _) = seed_album(&h.library).await;

    h.client
        .script_search(vec![handle("t-1", "goodpeer", r"a\01 - Says.flac")]);
    let parent = h
        .orchestrator
        .download_album(artist_id, album_id, None)
        .await
        .unwrap();

    h.client.set_downloads(vec![remote(
        "t-1",
        "goodpeer",
        r"a\01 - Says.flac",
        "InProgress",
        37.5,
    )]);
    h.orchestrator.check_completed_downloads().await.unwrap();

    let children = h
        .store
        .list_session_tracks(parent.session_id.as_deref().unwrap())
        .await
        .unwrap();
    let child = &children[0];
    assert_eq!(child.status, DownloadStatus::Downloading);
    assert_eq!(child.progress, 37.5);
    assert_eq!(child.last_state.as_deref(), Some("InProgress"));
    assert!(child.last_checked.is_some());
}

#[tokio::test]
async fn test_deferred_matching_adopts_external_id() {
    let h = harness().await;

    // flow tracks often come back without a transfer id
    h.client.script_search(vec![DownloadHandle {
        id: None,
        username: "moderat_fan".to_string(),
        filename: r"rips\Moderat - A New Error.flac".to_string(),
        size: 900,
        track: None,
    }]);
    let record = h
        .orchestrator
        .download_flow_track("Moderat", "A New Error")
        .await
        .unwrap();
    assert!(record.external_id.is_none());

    h.client.set_downloads(vec![remote(
        "late-id",
        "moderat_fan",
        r"rips\Moderat - A New Error.flac",
        "InProgress",
        12.0,
    )]);
    h.orchestrator.check_completed_downloads().await.unwrap();

    let record = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.external_id.as_deref(), Some("late-id"));
    assert_eq!(record.status, DownloadStatus::Downloading);
    assert_eq!(record.progress, 12.0);
}

#[tokio::test]
async fn test_unmatched_record_times_out() {
    let h = harness().await;

    let mut record = DownloadRecord::new_weekly_flow("Moderat", "Rusty Nails");
    record.external_id = Some("gone-1".to_string());
    record.created_at = Utc::now() - ChronoDuration::minutes(40);
    let created = record.created_at;
    let record = apply_event(record, DownloadEvent::Queued, created);
    h.store.insert(&record).await.unwrap();

    h.client.set_downloads(Vec::new());
    h.orchestrator.check_completed_downloads().await.unwrap();

    let record = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Timeout);
    assert_eq!(
        h.client.cancelled.lock().unwrap().clone(),
        vec!["gone-1".to_string()]
    );
}

#[tokio::test]
async fn test_unmatched_record_resubmitted_after_grace() {
    let h = harness().await;

    let mut record = DownloadRecord::new_weekly_flow("Moderat", "Rusty Nails");
    record.external_id = Some("gone-2".to_string());
    record.created_at = Utc::now() - ChronoDuration::minutes(15);
    let created = record.created_at;
    let record = apply_event(record, DownloadEvent::Queued, created);
    h.store.insert(&record).await.unwrap();

    h.client
        .script_search(vec![handle("fresh-1", "otherpeer", r"x\Rusty Nails.flac")]);
    h.client.set_downloads(Vec::new());
    h.orchestrator.check_completed_downloads().await.unwrap();

    let record = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Queued);
    assert_eq!(record.external_id.as_deref(), Some("fresh-1"));
    assert_eq!(record.requeue_count, 1);
    assert_eq!(h.client.search_count(), 1);
}

// ============================================================================
// FAILURES AND RETRIES
// ============================================================================

#[tokio::test]
async fn test_retry_waits_for_backoff_then_excludes_tried_peer() {
    let h = harness().await;

    let mut record = DownloadRecord::new_weekly_flow("Moderat", "Bad Kingdom");
    record.username = Some("flakypeer".to_string());
    record.mark_username_tried("flakypeer");
    let mut record = apply_event(
        record,
        DownloadEvent::Failed {
            error_type: "network".to_string(),
            message: "connection reset".to_string(),
        },
        Utc::now(),
    );
    h.store.insert(&record).await.unwrap();

    // backoff (30s for the first network retry) has not elapsed
    h.orchestrator.check_completed_downloads().await.unwrap();
    assert_eq!(h.client.search_count(), 0);

    // backdate the failure and poll again
    record.last_failure_at = Some(Utc::now() - ChronoDuration::minutes(5));
    h.store.save(&record).await.unwrap();
    h.client
        .script_search(vec![handle("fresh-2", "solidpeer", r"y\Bad Kingdom.flac")]);
    h.orchestrator.check_completed_downloads().await.unwrap();

    assert_eq!(h.client.search_count(), 1);
    let query = h.client.last_search();
    assert!(query.exclude_usernames.contains(&"flakypeer".to_string()));

    let record = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Queued);
    assert_eq!(record.username.as_deref(), Some("solidpeer"));
    assert!(record.tried_usernames.contains(&"flakypeer".to_string()));
    assert!(record.tried_usernames.contains(&"solidpeer".to_string()));
}

#[tokio::test]
async fn test_network_failures_keep_their_full_retry_budget() {
    let h = harness().await;

    // five failures in, still well inside the network budget of ten
    let mut record = DownloadRecord::new_weekly_flow("Moderat", "Rusty Nails");
    record.username = Some("flakypeer".to_string());
    record.mark_username_tried("flakypeer");
    let mut record = apply_event(
        record,
        DownloadEvent::Failed {
            error_type: "network".to_string(),
            message: "connection reset".to_string(),
        },
        Utc::now(),
    );
    record.retry_count = 5;
    record.last_failure_at = Some(Utc::now() - ChronoDuration::hours(1));
    h.store.insert(&record).await.unwrap();

    h.client
        .script_search(vec![handle("fresh-3", "solidpeer", r"y\Rusty Nails.flac")]);
    h.orchestrator.check_completed_downloads().await.unwrap();

    assert_eq!(h.client.search_count(), 1);
    let record = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Queued);
    assert_eq!(record.username.as_deref(), Some("solidpeer"));
}

#[tokio::test]
async fn test_not_found_failures_are_never_retried() {
    let h = harness().await;

    let record = DownloadRecord::new_weekly_flow("Moderat", "Ghost Track");
    let mut record = apply_event(
        record,
        DownloadEvent::Failed {
            error_type: "not_found".to_string(),
            message: "file not found on peer".to_string(),
        },
        Utc::now(),
    );
    record.last_failure_at = Some(Utc::now() - ChronoDuration::hours(2));
    h.store.insert(&record).await.unwrap();

    h.orchestrator.check_completed_downloads().await.unwrap();

    assert_eq!(h.client.search_count(), 0);
    let record = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
}

#[tokio::test]
async fn test_requeue_sweep_respects_age_and_queue_cleaner() {
    let h = harness().await;
    let old_failure = Utc::now() - ChronoDuration::minutes(45);

    let eligible = DownloadRecord::new_weekly_flow("Moderat", "Eating Hooks");
    let eligible = apply_event(
        eligible,
        DownloadEvent::Failed {
            error_type: "unknown".to_string(),
            message: "mystery".to_string(),
        },
        old_failure,
    );
    h.store.insert(&eligible).await.unwrap();

    let exhausted = DownloadRecord::new_weekly_flow("Moderat", "A New Error");
    let mut exhausted = apply_event(
        exhausted,
        DownloadEvent::Failed {
            error_type: "unknown".to_string(),
            message: "mystery".to_string(),
        },
        old_failure,
    );
    exhausted.retry_count = 3;
    h.store.insert(&exhausted).await.unwrap();

    let cleaned = DownloadRecord::new_weekly_flow("Moderat", "Running");
    let mut cleaned = apply_event(
        cleaned,
        DownloadEvent::Failed {
            error_type: "unknown".to_string(),
            message: "mystery".to_string(),
        },
        old_failure,
    );
    cleaned.queue_cleaned = true;
    h.store.insert(&cleaned).await.unwrap();

    let fresh = DownloadRecord::new_weekly_flow("Moderat", "Therapy");
    let fresh = apply_event(
        fresh,
        DownloadEvent::Failed {
            error_type: "unknown".to_string(),
            message: "mystery".to_string(),
        },
        Utc::now(),
    );
    h.store.insert(&fresh).await.unwrap();

    h.client
        .script_search(vec![handle("swept-1", "newpeer", r"z\Eating Hooks.flac")]);
    h.orchestrator.check_failed_downloads_for_requeue().await.unwrap();

    // only the old, uncleaned record got a fresh attempt
    assert_eq!(h.client.search_count(), 1);
    let eligible = h.store.get(&eligible.id).await.unwrap().unwrap();
    assert_eq!(eligible.status, DownloadStatus::Queued);
    assert_eq!(eligible.requeue_count, 1);

    let cleaned = h.store.get(&cleaned.id).await.unwrap().unwrap();
    assert_eq!(cleaned.status, DownloadStatus::Failed);
    let exhausted = h.store.get(&exhausted.id).await.unwrap().unwrap();
    assert_eq!(exhausted.status, DownloadStatus::Failed);
    let fresh = h.store.get(&fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, DownloadStatus::Failed);
}

// ============================================================================
// SINGLE TRACKS
// ============================================================================

#[tokio::test]
async fn test_single_track_import_moves_straight_to_library() {
    let h = harness().await;
    let (artist_id, _, track_ids) = seed_album(&h.library).await;

    h.client
        .script_search(vec![handle("t-9", "goodpeer", r"Music\01 - Says.flac")]);
    let record = h
        .orchestrator
        .download_track(artist_id, track_ids[0])
        .await
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Queued);

    place_file(&h.config.complete_dir.join("goodpeer/01 - Says.flac")).await;
    h.client.set_downloads(vec![remote(
        "t-9",
        "goodpeer",
        r"Music\01 - Says.flac",
        "Completed",
        100.0,
    )]);
    h.orchestrator.check_completed_downloads().await.unwrap();

    let record = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Added);
    let destination = record.destination_path.unwrap();
    assert!(Path::new(&destination).exists());
    assert!(destination.contains("Nils Frahm"));

    let track = h.library.get_track(track_ids[0]).await.unwrap().unwrap();
    assert!(track.has_file);
}

#[tokio::test]
async fn test_unconfigured_service_is_rejected() {
    let h = harness().await;
    let tmp_dir = h.config.complete_dir.clone();
    let mut mock = MockClient::new(tmp_dir);
    mock.configured = false;

    let db = Database::new_in_memory().await.unwrap();
    let orchestrator = DownloadOrchestrator::new(
        h.config.clone(),
        DownloadStore::new(db.pool().clone()),
        LibraryStore::new(db.pool().clone()),
        Arc::new(mock),
    );

    let err = orchestrator.download_flow_track("Artist", "Song").await;
    assert!(matches!(err, Err(MuseSyncError::ServiceNotConfigured)));
}

// ============================================================================
// RECOVERY
// ============================================================================

#[tokio::test]
async fn test_recovery_settles_both_sides_and_runs_once() {
    let h = harness().await;
    let (artist_id, _, track_ids) = seed_album(&h.library).await;

    // finished while the process was down
    let mut done = DownloadRecord::new_track(Some(artist_id), "Nils Frahm", Some(track_ids[0]), "Says");
    done.external_id = Some("r-1".to_string());
    let done = apply_event(
        done,
        DownloadEvent::Started {
            username: Some("goodpeer".to_string()),
            filename: Some(r"Music\01 - Says.flac".to_string()),
        },
        Utc::now() - ChronoDuration::minutes(20),
    );
    h.store.insert(&done).await.unwrap();
    place_file(&h.config.complete_dir.join("goodpeer/01 - Says.flac")).await;

    // vanished from the service entirely
    let mut gone = DownloadRecord::new_weekly_flow("Moderat", "Intruder");
    gone.external_id = Some("r-2".to_string());
    gone.created_at = Utc::now() - ChronoDuration::minutes(40);
    let created = gone.created_at;
    let gone = apply_event(gone, DownloadEvent::Queued, created);
    h.store.insert(&gone).await.unwrap();

    h.client.set_downloads(vec![remote(
        "r-1",
        "goodpeer",
        r"Music\01 - Says.flac",
        "Completed, Succeeded",
        100.0,
    )]);

    h.orchestrator.recover_interrupted_downloads().await.unwrap();

    let done = h.store.get(&done.id).await.unwrap().unwrap();
    assert_eq!(done.status, DownloadStatus::Added);
    let gone = h.store.get(&gone.id).await.unwrap().unwrap();
    assert_eq!(gone.status, DownloadStatus::Failed);
    assert_eq!(gone.error_type.as_deref(), Some("unknown"));

    // second call is a no-op: no further remote fetch
    let fetches = h.client.download_fetches.load(Ordering::SeqCst);
    h.orchestrator.recover_interrupted_downloads().await.unwrap();
    assert_eq!(h.client.download_fetches.load(Ordering::SeqCst), fetches);
}

#[tokio::test]
async fn test_recovery_orphan_completion_matched_by_filename() {
    let h = harness().await;

    // submitted before the crash; the service never reported an id
    h.client.script_search(vec![DownloadHandle {
        id: None,
        username: "peer7".to_string(),
        filename: r"shared\Moderat - Therapy.flac".to_string(),
        size: 900,
        track: None,
    }]);
    let record = h
        .orchestrator
        .download_flow_track("Moderat", "Therapy")
        .await
        .unwrap();
    assert!(record.external_id.is_none());

    place_file(&h.config.complete_dir.join("peer7/Moderat - Therapy.flac")).await;
    h.client.set_downloads(vec![remote(
        "orphan-1",
        "peer7",
        r"shared\Moderat - Therapy.flac",
        "Completed, Succeeded",
        100.0,
    )]);

    h.orchestrator.recover_interrupted_downloads().await.unwrap();

    let record = h.store.get(&record.id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Added);
    let destination = record.destination_path.unwrap();
    assert!(Path::new(&destination).exists());
}

#[tokio::test]
async fn test_recovery_adopts_unclaimed_finished_transfer() {
    let h = harness().await;

    // one ordinary interrupted record so the reconciler has work
    let mut queued = DownloadRecord::new_weekly_flow("Moderat", "Bad Kingdom");
    queued.external_id = Some("r-9".to_string());
    let queued = apply_event(queued, DownloadEvent::Queued, Utc::now());
    h.store.insert(&queued).await.unwrap();

    // a finished transfer no record ever asked for
    place_file(&h.config.complete_dir.join("peer3/Caribou - Odessa.flac")).await;
    h.client.set_downloads(vec![
        remote("r-9", "peer8", r"shared\Moderat - Bad Kingdom.flac", "Queued, Remotely", 0.0),
        remote("stray-1", "peer3", r"shared\Caribou - Odessa.flac", "Completed, Succeeded", 100.0),
    ]);

    h.orchestrator.recover_interrupted_downloads().await.unwrap();

    let adopted = h
        .store
        .get_by_external_id("stray-1")
        .await
        .unwrap()
        .expect("unclaimed transfer should get a record");
    assert_eq!(adopted.status, DownloadStatus::Added);
    assert_eq!(adopted.username.as_deref(), Some("peer3"));
    let destination = adopted.destination_path.expect("imported file path");
    assert!(Path::new(&destination).exists());
    assert!(destination.contains("Unsorted"));
}

#[tokio::test]
async fn test_recovery_leaves_young_records_alone() {
    let h = harness().await;

    let mut young = DownloadRecord::new_weekly_flow("Moderat", "Les Grandes Marches");
    young.external_id = Some("r-3".to_string());
    let young = apply_event(young, DownloadEvent::Queued, Utc::now());
    h.store.insert(&young).await.unwrap();

    h.client.set_downloads(Vec::new());
    h.orchestrator.recover_interrupted_downloads().await.unwrap();

    let young = h.store.get(&young.id).await.unwrap().unwrap();
    assert_eq!(young.status, DownloadStatus::Queued);
}
