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

//! Locating a finished download on disk
//!
//! The external service reports peer-side filenames (often with Windows
//! separators and peer-specific folder prefixes) that rarely match the
//! local path it actually wrote. Resolution tries, in order:
//!
//! 1. the exact path from the service's per-download detail endpoint
//! 2. a candidate grid of download roots x filename variants x optional
//!    per-peer subdirectory, each run through the remote path mappings
//! 3. a depth-bounded recursive search under the download roots with
//!    progressively fuzzier filename matching
//!
//! A miss is reported as [`MuseSyncError::PathResolutionFailed`]; callers
//! log it and leave the record for a later tick rather than retrying the
//! transfer.

use crate::config::DownloadConfig;
use crate::error::{MuseSyncError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tracing::{debug, trace};

fn track_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{1,3}\s*-\s*").unwrap_or_else(|_| unreachable!()))
}

fn dup_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(.+) \(\d+\)(\.[A-Za-z0-9]{1,5})$").unwrap_or_else(|_| unreachable!())
    })
}

/// Finds the local file behind a remote-reported filename
#[derive(Debug, Clone)]
pub struct PathResolver {
    config: DownloadConfig,
}

impl PathResolver {
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }

    /// Resolve a remote filename to an existing local file.
    ///
    /// `direct_path` is the path from the service's detail endpoint when it
    /// exposed one; `extra_roots` are download directories learned at
    /// runtime (the service's configured download dir) on top of the
    /// configured complete/incomplete roots.
    pub async fn resolve(
        &self,
        remote_filename: &str,
        username: Option<&str>,
        direct_path: Option<&Path>,
        extra_roots: &[PathBuf],
    ) -> Result<PathBuf> {
        // 1. exact path reported by the service
        if let Some(direct) = direct_path {
            let mapped = self.config.map_remote_path(direct);
            if file_exists(&mapped).await {
                debug!(path = %mapped.display(), "resolved via service-reported path");
                return Ok(mapped);
            }
            trace!(path = %mapped.display(), "service-reported path missing on disk");
        }

        let roots = self.roots(extra_roots);
        let variants = name_variants(remote_filename);

        // 2. candidate grid
        for candidate in self.candidate_grid(&roots, &variants, username, remote_filename) {
            if file_exists(&candidate).await {
                debug!(path = %candidate.display(), "resolved via candidate grid");
                return Ok(candidate);
            }
        }

        // 3. recursive fuzzy fallback
        let target = basename(remote_filename);
        let mut files = Vec::new();
        for root in &roots {
            collect_files(root, self.config.search_max_depth, &mut files).await;
        }
        if let Some(found) = fuzzy_match(&target, &files) {
            debug!(path = %found.display(), "resolved via recursive search");
            return Ok(found);
        }

        Err(MuseSyncError::PathResolutionFailed(format!(
            "no local file found for '{}' (peer {})",
            remote_filename,
            username.unwrap_or("unknown")
        )))
    }

    fn roots(&self, extra_roots: &[PathBuf]) -> Vec<PathBuf> {
        let mut roots = vec![
            self.config.complete_dir.clone(),
            self.config.incomplete_dir.clone(),
        ];
        for extra in extra_roots {
            if !roots.contains(extra) {
                roots.push(extra.clone());
            }
        }
        roots
    }

    fn candidate_grid(
        &self,
        roots: &[PathBuf],
        variants: &[String],
        username: Option<&str>,
        remote_filename: &str,
    ) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        // an absolute remote filename may map straight into a local mount
        let forward = remote_filename.replace('\\', "/");
        if forward.starts_with('/') {
            candidates.push(self.config.map_remote_path(Path::new(&forward)));
        }

        for root in roots {
            for variant in variants {
                candidates.push(self.config.map_remote_path(&root.join(variant)));
                if let Some(user) = username {
                    candidates.push(self.config.map_remote_path(&root.join(user).join(variant)));
                }
            }
        }

        candidates.dedup();
        candidates
    }
}

async fn file_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Final path component of a peer-reported filename, tolerating both
/// separator styles
pub fn basename(remote_filename: &str) -> String {
    remote_filename
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or(remote_filename)
        .to_string()
}

/// Filename variants to probe, most specific first
fn name_variants(remote_filename: &str) -> Vec<String> {
    let forward = remote_filename.replace('\\', "/");
    let relative = forward.trim_start_matches('/').to_string();
    let base = basename(remote_filename);

    let mut variants = vec![relative.clone(), base.clone()];

    // drop the peer's top-level share folder, keep the rest of the tree
    if let Some((_, rest)) = relative.split_once('/') {
        if rest != base {
            variants.push(rest.to_string());
        }
    }

    if let Some(suffix) = extract_track_suffix(&base) {
        if suffix != base {
            variants.push(suffix);
        }
    }

    variants.dedup();
    variants.retain(|v| !v.is_empty());
    variants
}

/// Extract a trailing `NN - Title.ext` from a longer release-style name,
/// e.g. `Artist - 2020 Album - 08 - Song Name.flac` -> `08 - Song Name.flac`
pub fn extract_track_suffix(name: &str) -> Option<String> {
    let start = track_prefix_re().find_iter(name).last()?.start();
    let suffix = &name[start..];
    if suffix.contains('.') {
        Some(suffix.to_string())
    } else {
        None
    }
}

/// Lowercase and treat `.`, `-`, `_` and whitespace runs as a single space
/// so peers' separator conventions compare equal
fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;
    for c in name.chars() {
        if matches!(c, '.' | '-' | '_') || c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Strip a ` (n)` duplicate-download suffix before the extension
fn strip_dup_suffix(name: &str) -> String {
    match dup_suffix_re().captures(name) {
        Some(caps) => format!("{}{}", &caps[1], &caps[2]),
        None => name.to_string(),
    }
}

/// Depth-bounded file collection under `dir`, breadth-first
async fn collect_files(dir: &Path, max_depth: usize, out: &mut Vec<PathBuf>) {
    let mut pending = vec![(dir.to_path_buf(), 0usize)];

    while let Some((current, depth)) = pending.pop() {
        let Ok(mut entries) = fs::read_dir(&current).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => {
                    if depth + 1 < max_depth {
                        pending.push((path, depth + 1));
                    }
                }
                Ok(ft) if ft.is_file() => out.push(path),
                _ => {}
            }
        }
    }
}

/// Match strategies over the collected tree, strictest first. Each strategy
/// scans the whole list before the next, looser one is tried.
fn fuzzy_match(target: &str, files: &[PathBuf]) -> Option<PathBuf> {
    let target_lower = target.to_ascii_lowercase();
    let target_norm = normalize(target);
    let target_suffix = extract_track_suffix(target).map(|s| normalize(&s));

    let named: Vec<(String, &PathBuf)> = files
        .iter()
        .filter_map(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| (n.to_string(), p))
        })
        .collect();

    // exact (case-insensitive)
    for (name, path) in &named {
        if name.to_ascii_lowercase() == target_lower {
            return Some((*path).clone());
        }
    }

    // separator-normalized
    for (name, path) in &named {
        if normalize(name) == target_norm {
            return Some((*path).clone());
        }
    }

    // duplicate-suffix stripped, e.g. `song (1).flac`
    for (name, path) in &named {
        if normalize(&strip_dup_suffix(name)) == target_norm {
            return Some((*path).clone());
        }
    }

    // track-number suffix, full or trailing match in either direction
    if let Some(suffix) = &target_suffix {
        for (name, path) in &named {
            let name_norm = normalize(name);
            if name_norm == *suffix || name_norm.ends_with(suffix.as_str()) {
                return Some((*path).clone());
            }
        }
    }
    for (name, path) in &named {
        if let Some(name_suffix) = extract_track_suffix(name).map(|s| normalize(&s)) {
            if name_suffix == target_norm || target_norm.ends_with(name_suffix.as_str()) {
                return Some((*path).clone());
            }
        }
    }

    None
}
