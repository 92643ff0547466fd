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


//! HTTP client for the slskd download daemon
//!
//! Thin wrapper over `reqwest` implementing [`DownloadClient`] against the
//! slskd JSON API: searches, the transfer list, per-transfer detail, cancel,
//! and the options endpoint for the daemon's download directory.
//!
//! Search-and-download is the one multi-step call: initiate a search, poll
//! until it settles (bounded), pick the best responding peer not already
//! tried, then enqueue that peer's files as transfers.

use crate::error::{MuseSyncError, Result};
use crate::slskd::types::{decode_detail, flatten_downloads, RemoteDownload, RemoteDownloadDetail};
use crate::slskd::{DownloadClient, DownloadHandle, SearchQuery};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;
use uuid::Uuid;

/// How long to wait for a search to settle before taking whatever responses
/// arrived
const SEARCH_WAIT: Duration = Duration::from_secs(30);

/// Poll interval while a search is in flight
const SEARCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Connection settings for the daemon
#[derive(Debug, Clone, Default)]
pub struct SlskdConfig {
    /// Base URL, e.g. `http://localhost:5030`
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

impl SlskdConfig {
    pub fn is_configured(&self) -> bool {
        self.base_url.is_some() && self.api_key.is_some()
    }
}

/// reqwest-backed implementation of [`DownloadClient`]
#[derive(Debug, Clone)]
pub struct SlskdClient {
    http: Client,
    config: SlskdConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    response_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponseFile {
    filename: String,
    #[serde(default)]
    size: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    username: String,
    #[serde(default)]
    files: Vec<SearchResponseFile>,
    #[serde(default)]
    has_free_upload_slot: bool,
    #[serde(default)]
    upload_speed: i64,
}

impl SlskdClient {
    pub fn new(config: SlskdConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(ref key) = config.api_key {
            let value = HeaderValue::from_str(key)
                .map_err(|_| MuseSyncError::ConfigurationError("Invalid API key".to_string()))?;
            headers.insert("X-API-Key", value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let base = self
            .config
            .base_url
            .as_deref()
            .ok_or(MuseSyncError::ServiceNotConfigured)?;
        let base = Url::parse(base)
            .map_err(|e| MuseSyncError::ConfigurationError(format!("Invalid base URL: {}", e)))?;
        base.join(path)
            .map_err(|e| MuseSyncError::ConfigurationError(format!("Invalid endpoint: {}", e)))
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.endpoint(path)?;
        let response = self.http.get(url).send().await?;
        Self::check_status(&response)?;
        Ok(response.json().await?)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.endpoint(path)?;
        let response = self.http.post(url).json(body).send().await?;
        Self::check_status(&response)?;
        if response.content_length() == Some(0) {
            return Ok(Value::Null);
        }
        Ok(response.json().await.unwrap_or(Value::Null))
    }

    fn check_status(response: &reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(MuseSyncError::service_failed(
            format!("HTTP {} from {}", status, response.url()),
            Some(status.as_u16()),
        ))
    }

    /// Pick the best responding peer: untried, file count closest to (but at
    /// least) the expected track count, free slots and speed as tie-breakers.
    fn select_response<'a>(
        query: &SearchQuery,
        responses: &'a [SearchResponse],
    ) -> Option<&'a SearchResponse> {
        let expected = query.tracks.len();
        let mut candidates: Vec<&SearchResponse> = responses
            .iter()
            .filter(|r| !r.files.is_empty())
            .filter(|r| !query.exclude_usernames.iter().any(|u| u == &r.username))
            .filter(|r| expected == 0 || r.files.len() >= expected)
            .collect();

        candidates.sort_by(|a, b| {
            (b.has_free_upload_slot, b.upload_speed)
                .partial_cmp(&(a.has_free_upload_slot, a.upload_speed))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.into_iter().next()
    }
}

#[async_trait]
impl DownloadClient for SlskdClient {
    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    async fn search_and_download(&self, query: &SearchQuery) -> Result<Vec<DownloadHandle>> {
        if !self.is_configured() {
            return Err(MuseSyncError::ServiceNotConfigured);
        }

        // initiate the search
        let search_id = Uuid::new_v4().to_string();
        self.post_json(
            "/api/v0/searches",
            &json!({ "id": search_id, "searchText": query.text }),
        )
        .await?;

        // poll until the search settles or the wait budget runs out
        let deadline = tokio::time::Instant::now() + SEARCH_WAIT;
        loop {
            let status: SearchStatus =
                serde_json::from_value(self.get_json(&format!("/api/v0/searches/{}", search_id)).await?)?;
            let settled = status.state.to_ascii_lowercase().contains("completed");
            if settled || tokio::time::Instant::now() >= deadline {
                if status.response_count == 0 && settled {
                    return Err(MuseSyncError::NoCandidatesFound(query.text.clone()));
                }
                break;
            }
            sleep(SEARCH_POLL_INTERVAL).await;
        }

        let responses: Vec<SearchResponse> = serde_json::from_value(
            self.get_json(&format!("/api/v0/searches/{}/responses", search_id))
                .await?,
        )?;

        let chosen = Self::select_response(query, &responses)
            .ok_or_else(|| MuseSyncError::NoCandidatesFound(query.text.clone()))?;

        // enqueue every file from the chosen peer as one transfer request
        let files: Vec<Value> = chosen
            .files
            .iter()
            .map(|f| json!({ "filename": f.filename, "size": f.size }))
            .collect();
        self.post_json(
            &format!("/api/v0/transfers/downloads/{}", chosen.username),
            &Value::Array(files),
        )
        .await?;

        // the daemon assigns transfer ids asynchronously; correlate what we
        // can from the current transfer list
        let downloads = self.get_downloads().await.unwrap_or_default();
        let handles = chosen
            .files
            .iter()
            .map(|f| {
                let id = downloads
                    .iter()
                    .find(|d| d.username == chosen.username && d.filename == f.filename)
                    .and_then(|d| d.id.clone());
                DownloadHandle {
                    id,
                    username: chosen.username.clone(),
                    filename: f.filename.clone(),
                    size: f.size,
                    track: None,
                }
            })
            .collect();

        Ok(handles)
    }

    async fn get_downloads(&self) -> Result<Vec<RemoteDownload>> {
        let payload = self.get_json("/api/v0/transfers/downloads").await?;
        Ok(flatten_downloads(payload))
    }

    async fn get_download(&self, id: &str) -> Result<Option<RemoteDownloadDetail>> {
        let path = format!("/api/v0/transfers/downloads/all/{}", id);
        match self.get_json(&path).await {
            Ok(payload) => Ok(decode_detail(payload)),
            Err(MuseSyncError::ServiceRequestFailed {
                status_code: Some(code),
                ..
            }) if code == StatusCode::NOT_FOUND.as_u16() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn cancel_download(&self, id: &str) -> Result<()> {
        let url = self.endpoint(&format!("/api/v0/transfers/downloads/all/{}", id))?;
        let response = self.http.delete(url).send().await?;
        // cancelling an already-gone transfer is not an error
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check_status(&response)
    }

    async fn download_directory(&self) -> Result<PathBuf> {
        let payload = self.get_json("/api/v0/options").await?;
        payload
            .pointer("/directories/downloads")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .ok_or_else(|| {
                MuseSyncError::ConfigurationError(
                    "Daemon options did not report a download directory".to_string(),
                )
            })
    }
}
