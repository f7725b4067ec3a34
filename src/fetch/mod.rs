// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod filename;
mod http;
mod ytdlp;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Channel;
use crate::error::FetchError;
use crate::listing::Item;

pub use filename::{artifact_filename, artifact_stem, media_extension, sanitize_component};
pub use http::HttpFetcher;
pub use ytdlp::YtDlpFetcher;

/// Suffix marking an in-progress download (file or staging directory)
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Files an item was materialized into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub files: Vec<PathBuf>,
    pub bytes: u64,
}

/// Materializes one item into its channel's destination directory
///
/// Implementations must only make the artifact visible under its final name
/// once it is completely written, and must keep in-progress data under a
/// name ending in [`PARTIAL_SUFFIX`].
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    async fn fetch(&self, channel: &Channel, item: &Item) -> Result<Artifact, FetchError>;
}

/// A shared reference to a fetch adapter
pub type SharedFetcher = Arc<dyn FetchAdapter>;

/// Create `dir` if needed and remove leftovers of interrupted downloads
///
/// Returns the number of partial files or staging directories removed.
pub async fn prepare_destination(dir: &Path) -> Result<usize, FetchError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| FetchError::PrepareFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| FetchError::PrepareFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    let mut cleaned = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FetchError::PrepareFailed {
            path: dir.to_path_buf(),
            source: e,
        })?
    {
        let path = entry.path();
        let is_partial = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX));
        if !is_partial {
            continue;
        }

        let removed = match entry.file_type().await {
            Ok(t) if t.is_dir() => tokio::fs::remove_dir_all(&path).await,
            _ => tokio::fs::remove_file(&path).await,
        };
        if removed.is_ok() {
            cleaned += 1;
        }
    }

    Ok(cleaned)
}

/// Path of the in-progress twin of `path`
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn prepare_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("channel");

        let cleaned = prepare_destination(&dest).await.unwrap();
        assert_eq!(cleaned, 0);
        assert!(dest.is_dir());
    }

    #[tokio::test]
    async fn prepare_removes_partial_leftovers_only() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp3.partial"), b"half").unwrap();
        std::fs::create_dir(dir.path().join("vid-1.partial")).unwrap();
        std::fs::write(dir.path().join("vid-1.partial").join("x.mp4.part"), b"half").unwrap();
        std::fs::write(dir.path().join("done.mp4"), b"complete").unwrap();

        let cleaned = prepare_destination(dir.path()).await.unwrap();

        assert_eq!(cleaned, 2);
        assert!(!dir.path().join("a.mp3.partial").exists());
        assert!(!dir.path().join("vid-1.partial").exists());
        assert!(dir.path().join("done.mp4").exists());
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/d/ep.mp3")),
            PathBuf::from("/d/ep.mp3.partial")
        );
    }
}
