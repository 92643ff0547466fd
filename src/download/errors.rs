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

//! Failure classification
//!
//! Pure mapping from a raw failure (status code, message, network error) to
//! one of a fixed set of categories. The retry policy keys off the category,
//! never off the raw failure. Precedence is first-match: rate-limit
//! indicators, then network, then not-found, then server error, then
//! permanent client error, then unknown.

use crate::error::MuseSyncError;
use serde::{Deserialize, Serialize};

/// Category assigned to a failure, persisted on the record as `error_type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    #[serde(rename = "rate_limit")]
    RateLimit,
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "server_error")]
    ServerError,
    #[serde(rename = "not_found")]
    NotFound,
    #[serde(rename = "permanent")]
    Permanent,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Network => "network",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "rate_limit" => ErrorCategory::RateLimit,
            "network" => ErrorCategory::Network,
            "server_error" => ErrorCategory::ServerError,
            "not_found" => ErrorCategory::NotFound,
            "permanent" => ErrorCategory::Permanent,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Terminal categories are never retried
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorCategory::NotFound | ErrorCategory::Permanent)
    }
}

/// A raw failure to classify: at minimum a message, optionally a status code
#[derive(Debug, Clone)]
pub struct Failure {
    pub message: String,
    pub status_code: Option<u16>,
}

impl Failure {
    pub fn new<S: Into<String>>(message: S, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status_code,
        }
    }

    pub fn from_error(error: &MuseSyncError) -> Self {
        Self {
            message: error.to_string(),
            status_code: error.status_code(),
        }
    }
}

const NETWORK_INDICATORS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connect",
    "econnrefused",
    "econnreset",
    "etimedout",
    "enotfound",
    "dns",
    "unreachable",
];

/// Classify a failure into its category. No side effects.
pub fn classify_failure(failure: &Failure) -> ErrorCategory {
    let message = failure.message.to_ascii_lowercase();
    let status = failure.status_code;

    // rate limiting first: a 429 often carries a network-ish message too
    if status == Some(429) || message.contains("rate limit") || message.contains("too many requests")
    {
        return ErrorCategory::RateLimit;
    }

    if NETWORK_INDICATORS.iter().any(|n| message.contains(n)) {
        return ErrorCategory::Network;
    }

    if status == Some(404) || message.contains("not found") {
        return ErrorCategory::NotFound;
    }

    if let Some(code) = status {
        if (500..=503).contains(&code) {
            return ErrorCategory::ServerError;
        }
        if (400..=499).contains(&code) {
            return ErrorCategory::Permanent;
        }
    }

    ErrorCategory::Unknown
}
