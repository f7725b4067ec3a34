// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StateError;

/// Layout version written to the state file
const STATE_VERSION: u32 = 1;

/// Seen item ids per channel id
pub type SeenMap = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default)]
    channels: SeenMap,
}

#[derive(Serialize)]
struct PersistedStateRef<'a> {
    version: u32,
    channels: &'a SeenMap,
}

/// Result of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The item was added and the state file replaced
    Committed,
    /// The item was already recorded; nothing was written
    AlreadySeen,
}

/// Durable record of which items have been downloaded for each channel
///
/// The in-memory map is the snapshot taken at load time plus every commit
/// since. All writers go through [`ProgressStore::commit`], which holds a
/// single lock across the read-modify-write so that commits for different
/// channels never overwrite each other.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    seen: Mutex<SeenMap>,
}

impl ProgressStore {
    /// Load progress from `path`
    ///
    /// A missing or empty file is a first run. Anything that does not parse
    /// is reported as corrupt rather than treated as empty.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::empty(path));
            }
            Err(e) => {
                return Err(StateError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Self::empty(path));
        }

        let state: PersistedState =
            serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                source: e,
            })?;

        if state.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: state.version,
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            seen: Mutex::new(state.channels),
        })
    }

    /// A store with no progress that will persist to `path` on first commit
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            seen: Mutex::new(SeenMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the full progress map
    pub async fn snapshot(&self) -> SeenMap {
        self.seen.lock().await.clone()
    }

    /// Seen item ids for one channel
    pub async fn seen(&self, channel_id: &str) -> HashSet<String> {
        self.seen
            .lock()
            .await
            .get(channel_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn contains(&self, channel_id: &str, item_id: &str) -> bool {
        self.seen
            .lock()
            .await
            .get(channel_id)
            .is_some_and(|ids| ids.contains(item_id))
    }

    /// Mark one item as downloaded and durably persist the new state
    ///
    /// Returns only after the state file has been atomically replaced. If
    /// persisting fails, the in-memory map is left as it was.
    pub async fn commit(
        &self,
        channel_id: &str,
        item_id: &str,
    ) -> Result<CommitOutcome, StateError> {
        let mut seen = self.seen.lock().await;

        let created_channel = match seen.get(channel_id) {
            Some(ids) if ids.contains(item_id) => return Ok(CommitOutcome::AlreadySeen),
            Some(_) => false,
            None => true,
        };

        seen.entry(channel_id.to_string())
            .or_default()
            .insert(item_id.to_string());

        if let Err(e) = self.persist(&seen).await {
            if created_channel {
                seen.remove(channel_id);
            } else if let Some(ids) = seen.get_mut(channel_id) {
                ids.remove(item_id);
            }
            return Err(e);
        }

        Ok(CommitOutcome::Committed)
    }

    /// Write the whole map to a temp file next to the state file, sync it,
    /// then rename it over the live file
    async fn persist(&self, seen: &SeenMap) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(&PersistedStateRef {
            version: STATE_VERSION,
            channels: seen,
        })?;

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);

        if let Some(parent) = &parent {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.write_failed(parent, e))?;
        }

        let tmp_path = temp_path(&self.path);

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| self.write_failed(&tmp_path, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| self.write_failed(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| self.write_failed(&tmp_path, e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| self.write_failed(&self.path, e))?;

        if let Some(parent) = parent {
            sync_dir(&parent).await;
        }

        Ok(())
    }

    fn write_failed(&self, path: &Path, source: std::io::Error) -> StateError {
        tracing::error!(path = %path.display(), error = %source, "Failed to persist progress state");
        StateError::WriteFailed {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Sibling path used while replacing the state file
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("progress.json"));
    name.push(".tmp");
    path.with_file_name(name)
}

/// Make the rename itself durable where the platform allows it
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = tokio::fs::File::open(dir).await {
            let _ = handle.sync_all().await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = ProgressStore::load(&dir.path().join("progress.json")).unwrap();
        assert!(store.seen.try_lock().unwrap().is_empty());
    }

    #[test]
    fn load_empty_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "  \n").unwrap();

        let store = ProgressStore::load(&path).unwrap();
        assert!(store.seen.try_lock().unwrap().is_empty());
    }

    #[test]
    fn load_truncated_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, r#"{"version": 1, "channels": {"a": ["x", "#).unwrap();

        let result = ProgressStore::load(&path);
        assert!(matches!(result, Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn load_wrong_shape_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, r#"["not", "a", "map"]"#).unwrap();

        assert!(matches!(
            ProgressStore::load(&path),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn load_binary_garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x7b]).unwrap();

        assert!(matches!(
            ProgressStore::load(&path),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn load_rejects_unknown_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, r#"{"version": 7, "channels": {}}"#).unwrap();

        assert!(matches!(
            ProgressStore::load(&path),
            Err(StateError::UnsupportedVersion { version: 7, .. })
        ));
    }

    #[test]
    fn load_directory_is_read_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ProgressStore::load(dir.path()),
            Err(StateError::ReadFailed { .. })
        ));
    }

    #[tokio::test]
    async fn commit_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("progress.json");

        let store = ProgressStore::load(&path).unwrap();
        assert_eq!(
            store.commit("chan", "item-1").await.unwrap(),
            CommitOutcome::Committed
        );
        store.commit("other", "item-9").await.unwrap();

        let reloaded = ProgressStore::load(&path).unwrap();
        assert!(reloaded.contains("chan", "item-1").await);
        assert!(reloaded.contains("other", "item-9").await);
        assert!(!reloaded.contains("chan", "item-9").await);
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let store = ProgressStore::load(&path).unwrap();

        store.commit("chan", "item-1").await.unwrap();
        let before = store.snapshot().await;

        // A no-op commit must not touch the file at all
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            store.commit("chan", "item-1").await.unwrap(),
            CommitOutcome::AlreadySeen
        );
        assert!(!path.exists());
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn concurrent_commits_are_not_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");
        let store = Arc::new(ProgressStore::load(&path).unwrap());

        let mut handles = Vec::new();
        for channel in 0..4 {
            for item in 0..10 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    store
                        .commit(&format!("chan-{channel}"), &format!("item-{item}"))
                        .await
                        .unwrap();
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let reloaded = ProgressStore::load(&path).unwrap();
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.values().all(|ids| ids.len() == 10));
    }

    #[tokio::test]
    async fn stale_temp_file_is_ignored_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let store = ProgressStore::load(&path).unwrap();
        store.commit("chan", "item-1").await.unwrap();

        // Simulate a crash after the temp file was half written
        std::fs::write(temp_path(&path), r#"{"version": 1, "chan"#).unwrap();

        let reloaded = ProgressStore::load(&path).unwrap();
        assert!(reloaded.contains("chan", "item-1").await);
        assert_eq!(reloaded.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let store = ProgressStore::empty(&blocker.join("progress.json"));

        let result = store.commit("chan", "item-1").await;
        assert!(matches!(result, Err(StateError::WriteFailed { .. })));
        assert!(!store.contains("chan", "item-1").await);
        assert!(store.snapshot().await.is_empty());
    }

    #[test]
    fn temp_path_is_a_sibling() {
        assert_eq!(
            temp_path(Path::new("/var/lib/af/progress.json")),
            PathBuf::from("/var/lib/af/progress.json.tmp")
        );
    }
}
