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

//! MuseSync core: download orchestration for an automated music library.
//!
//! The crate drives an slskd-style peer-network download daemon: it
//! accepts album/track requests, records every attempt, polls the daemon,
//! classifies failures with per-category retry budgets, and moves
//! finished files into the library tree. Hosts embed
//! [`download::DownloadOrchestrator`] and call its poll entry points on
//! their own schedule.

pub mod config;
pub mod download;
pub mod error;
pub mod file;
pub mod slskd;
pub mod storage;

pub use config::{DownloadConfig, PathMapping};
pub use download::DownloadOrchestrator;
pub use error::{MuseSyncError, Result};
pub use slskd::{SlskdClient, SlskdConfig};
pub use storage::database::Database;
