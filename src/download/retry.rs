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

//! Per-category retry budgets and backoff
//!
//! Nothing here sleeps. A retry becomes *eligible* once the elapsed time
//! since the last failure meets the backoff for the current attempt; the
//! poll loop re-checks eligibility on every cycle and acts only then.

use super::errors::ErrorCategory;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);

/// Retry rules for one failure category
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    category: ErrorCategory,
}

impl RetryPolicy {
    pub fn for_category(category: ErrorCategory) -> Self {
        Self { category }
    }

    /// Maximum number of retries after the first failure
    pub fn max_retries(&self) -> u32 {
        match self.category {
            ErrorCategory::RateLimit => 5,
            ErrorCategory::Network => 10,
            ErrorCategory::ServerError => 3,
            ErrorCategory::NotFound | ErrorCategory::Permanent => 0,
            ErrorCategory::Unknown => 3,
        }
    }

    /// Whether a record that has already failed `attempt` times still has
    /// retry budget left
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries() && self.max_retries() > 0
    }

    /// Backoff before retry number `attempt` (1-based). Rate-limit backoff
    /// carries random jitter, so two calls may differ.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.category {
            ErrorCategory::RateLimit => {
                let jitter_secs = rand::thread_rng().gen_range(0..=120);
                5 * attempt * MINUTE + Duration::from_secs(jitter_secs)
            }
            ErrorCategory::Network => {
                let linear = Duration::from_secs(30 * u64::from(attempt));
                linear.min(5 * MINUTE)
            }
            ErrorCategory::ServerError | ErrorCategory::Unknown => {
                // exponential in minutes, saturating well before overflow
                let exp = 2u64.saturating_pow(attempt.min(20));
                Duration::from_secs(exp.saturating_mul(60))
            }
            ErrorCategory::NotFound | ErrorCategory::Permanent => Duration::ZERO,
        }
    }

    /// Pull-based eligibility check: true once enough time has passed since
    /// the last failure for retry number `attempt`. The jitter for
    /// rate-limit backoff is drawn here, at decision time.
    pub fn is_retry_due(
        &self,
        attempt: u32,
        last_failure_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.should_retry(attempt) {
            return false;
        }
        let Some(failed_at) = last_failure_at else {
            // no recorded failure time: nothing to wait for
            return true;
        };
        let elapsed = (now - failed_at).to_std().unwrap_or(Duration::ZERO);
        elapsed >= self.backoff(attempt)
    }
}
