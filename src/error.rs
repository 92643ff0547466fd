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


//! Crate-wide error type
//!
//! Variants are grouped by domain (download service, data consistency,
//! filesystem, configuration) so the failure classifier and callers can
//! tell transient trouble apart from terminal trouble.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MuseSyncError>;

#[derive(Error, Debug)]
pub enum MuseSyncError {
    // ===== Download service =====

    /// The external download service has no usable configuration
    #[error("Download service is not configured")]
    ServiceNotConfigured,

    /// A request to the external download service failed
    #[error("Download service request failed: {message}")]
    ServiceRequestFailed {
        message: String,
        /// HTTP status, when the failure got that far
        status_code: Option<u16>,
    },

    /// A search returned no usable download candidates
    #[error("No download candidates found for: {0}")]
    NoCandidatesFound(String),

    // ===== Data consistency =====
    // Never retried: these indicate a caller or library-store bug.

    /// Requested entity does not belong to the claimed parent
    #[error("Data consistency violation: {0}")]
    DataConsistency(String),

    /// Database record not found
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // ===== Filesystem =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic file I/O failure with context
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// No resolution strategy produced an existing local path
    #[error("Could not resolve local path for downloaded file: {0}")]
    PathResolutionFailed(String),

    /// A copied file did not match the source size
    #[error("File verification failed: expected {expected} bytes, got {actual} bytes at {path}")]
    FileVerificationFailed {
        path: String,
        expected: u64,
        actual: u64,
    },

    // ===== Input and configuration =====

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // ===== External libraries =====

    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MuseSyncError {
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        MuseSyncError::RecordNotFound(resource.into())
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        MuseSyncError::InvalidInput(message.into())
    }

    pub fn service_failed<S: Into<String>>(message: S, status_code: Option<u16>) -> Self {
        MuseSyncError::ServiceRequestFailed {
            message: message.into(),
            status_code,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            MuseSyncError::ServiceRequestFailed { status_code, .. } => *status_code,
            MuseSyncError::ReqwestError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
