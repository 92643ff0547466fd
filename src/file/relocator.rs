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

//! Moving finished files into the library
//!
//! A move prefers an atomic rename and falls back to copy, size-verify,
//! delete when the download roots and the library sit on different
//! filesystems. After a successful move the now-empty peer folders under
//! the download roots are pruned.

use crate::error::{MuseSyncError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Moves files out of the download roots into the library tree
#[derive(Debug, Clone)]
pub struct FileRelocator {
    /// Roots the empty-directory cleanup walks up to but never removes
    cleanup_roots: Vec<PathBuf>,
}

impl FileRelocator {
    pub fn new(cleanup_roots: Vec<PathBuf>) -> Self {
        Self { cleanup_roots }
    }

    /// Move `source` to `destination`, returning the destination path.
    ///
    /// Idempotent against replays: a destination that already exists with
    /// the source's size is treated as an already-finished move.
    pub async fn relocate(&self, source: &Path, destination: &Path) -> Result<PathBuf> {
        if !file_exists(source).await {
            if file_exists(destination).await {
                // a previous tick finished this move
                return Ok(destination.to_path_buf());
            }
            return Err(MuseSyncError::FileNotFound(source.display().to_string()));
        }

        let source_size = file_size(source).await?;

        if file_exists(destination).await {
            let dest_size = file_size(destination).await?;
            if dest_size == source_size {
                debug!(
                    destination = %destination.display(),
                    "destination already present with matching size, dropping source"
                );
                remove_file(source).await?;
                self.cleanup_empty_dirs(source).await;
                return Ok(destination.to_path_buf());
            }
            // stale or truncated previous attempt
            remove_file(destination).await?;
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                MuseSyncError::FileIoError(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        match fs::rename(source, destination).await {
            Ok(()) => {}
            Err(rename_err) => {
                // EXDEV or similar: copy across filesystems and verify
                debug!(
                    source = %source.display(),
                    error = %rename_err,
                    "rename failed, falling back to copy"
                );
                fs::copy(source, destination).await.map_err(|e| {
                    MuseSyncError::FileIoError(format!(
                        "Copy failed: {} -> {}: {}",
                        source.display(),
                        destination.display(),
                        e
                    ))
                })?;

                let copied_size = file_size(destination).await?;
                if copied_size != source_size {
                    // leave the source; a later tick can retry
                    let _ = fs::remove_file(destination).await;
                    return Err(MuseSyncError::FileVerificationFailed {
                        path: destination.display().to_string(),
                        expected: source_size,
                        actual: copied_size,
                    });
                }
                remove_file(source).await?;
            }
        }

        self.cleanup_empty_dirs(source).await;
        Ok(destination.to_path_buf())
    }

    /// Remove empty directories from the moved file's folder up toward a
    /// cleanup root. Best effort, stops at the first non-empty folder.
    async fn cleanup_empty_dirs(&self, moved_from: &Path) {
        let mut current = moved_from.parent();

        while let Some(dir) = current {
            if self.cleanup_roots.iter().any(|root| root == dir) {
                break;
            }
            if !self.cleanup_roots.iter().any(|root| dir.starts_with(root)) {
                break;
            }

            match fs::read_dir(dir).await {
                Ok(mut entries) => match entries.next_entry().await {
                    Ok(None) => {
                        if let Err(e) = fs::remove_dir(dir).await {
                            warn!(dir = %dir.display(), error = %e, "failed to prune empty directory");
                            break;
                        }
                    }
                    _ => break,
                },
                Err(_) => break,
            }

            current = dir.parent();
        }
    }
}

/// Replace characters that are unsafe in library path components
pub fn sanitize_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut kept_any = false;
    for c in name.chars() {
        match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            c if c.is_control() => {}
            c => {
                kept_any = true;
                out.push(c);
            }
        }
    }
    let trimmed = out.trim().trim_end_matches('.');
    if !kept_any || trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

async fn file_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

async fn file_size(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path).await.map_err(|e| {
        MuseSyncError::FileIoError(format!("Failed to stat {}: {}", path.display(), e))
    })?;
    Ok(metadata.len())
}

async fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).await.map_err(|e| {
        MuseSyncError::FileIoError(format!("Delete failed: {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write(path: &Path, contents: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.unwrap();
        }
        fs::write(path, contents).await.unwrap();
    }

    #[tokio::test]
    async fn test_relocate_moves_file() {
        let tmp = TempDir::new().unwrap();
        let downloads = tmp.path().join("downloads");
        let relocator = FileRelocator::new(vec![downloads.clone()]);

        let source = downloads.join("peer/album/01 - Song.flac");
        write(&source, b"content").await;
        let dest = tmp.path().join("library/Artist/Album/01 - Song.flac");

        let moved = relocator.relocate(&source, &dest).await.unwrap();
        assert_eq!(moved, dest);
        assert!(dest.exists());
        assert!(!source.exists());
        // peer folders pruned, downloads root kept
        assert!(!downloads.join("peer").exists());
        assert!(downloads.exists());
    }

    #[tokio::test]
    async fn test_relocate_idempotent_when_destination_matches() {
        let tmp = TempDir::new().unwrap();
        let downloads = tmp.path().join("downloads");
        let relocator = FileRelocator::new(vec![downloads.clone()]);

        let source = downloads.join("song.flac");
        write(&source, b"same bytes").await;
        let dest = tmp.path().join("library/song.flac");
        write(&dest, b"same bytes").await;

        let moved = relocator.relocate(&source, &dest).await.unwrap();
        assert_eq!(moved, dest);
        assert!(!source.exists());
        assert_eq!(fs::read(&dest).await.unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn test_relocate_overwrites_mismatched_destination() {
        let tmp = TempDir::new().unwrap();
        let downloads = tmp.path().join("downloads");
        let relocator = FileRelocator::new(vec![downloads.clone()]);

        let source = downloads.join("song.flac");
        write(&source, b"full download").await;
        let dest = tmp.path().join("library/song.flac");
        write(&dest, b"partial").await;

        relocator.relocate(&source, &dest).await.unwrap();
        assert_eq!(fs::read(&dest).await.unwrap(), b"full download");
    }

    #[tokio::test]
    async fn test_relocate_source_already_gone() {
        let tmp = TempDir::new().unwrap();
        let relocator = FileRelocator::new(vec![tmp.path().to_path_buf()]);

        let source = tmp.path().join("gone.flac");
        let dest = tmp.path().join("library/gone.flac");

        // neither side exists: error
        let err = relocator.relocate(&source, &dest).await;
        assert!(matches!(err, Err(MuseSyncError::FileNotFound(_))));

        // destination exists: treated as finished
        write(&dest, b"done").await;
        let moved = relocator.relocate(&source, &dest).await.unwrap();
        assert_eq!(moved, dest);
    }

    #[tokio::test]
    async fn test_cleanup_stops_outside_roots() {
        let tmp = TempDir::new().unwrap();
        let downloads = tmp.path().join("downloads");
        let relocator = FileRelocator::new(vec![downloads.clone()]);

        // source outside any cleanup root: its parent must survive
        let outside = tmp.path().join("elsewhere/song.flac");
        write(&outside, b"x").await;
        let dest = tmp.path().join("library/song.flac");

        relocator.relocate(&outside, &dest).await.unwrap();
        assert!(tmp.path().join("elsewhere").exists());
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("AC/DC"), "AC_DC");
        assert_eq!(sanitize_component("What? No!"), "What_ No!");
        assert_eq!(sanitize_component("  trailing.  "), "trailing");
        assert_eq!(sanitize_component("///"), "unknown");
        assert_eq!(sanitize_component("   "), "unknown");
    }
}
