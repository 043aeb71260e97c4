//! Durable mirror snapshots.
//!
//! The mirror survives process restart through a [`SnapshotStore`]; the
//! JSON-file implementation below is the reference. Snapshots are loaded on
//! start, demoted to `Cached` past the staleness threshold, and refreshed in
//! the background rather than trusted as current.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::MirrorEntry;
use crate::keys::RecordKey;
use crate::types::{Result, SyncError};

/// One persisted mirror entry. Keys are stored as plain external ids and
/// re-validated on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: String,
    pub entry: MirrorEntry,
}

/// Durable storage for mirror snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    async fn load(&self) -> Result<Vec<PersistedEntry>>;
    async fn save(&self, entries: &[PersistedEntry]) -> Result<()>;
}

/// JSON-file snapshot store.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<PersistedEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(SyncError::Persistence(e.to_string())),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            // A corrupt snapshot is not fatal; the mirror just starts cold
            warn!(path = %self.path.display(), error = %e, "snapshot unreadable");
            SyncError::Persistence(e.to_string())
        })
    }

    async fn save(&self, entries: &[PersistedEntry]) -> Result<()> {
        let bytes = serde_json::to_vec(entries)
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        // Write-then-rename so a crash mid-save never truncates the old
        // snapshot
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        Ok(())
    }
}

/// Convert in-memory entries to their persisted form.
pub fn to_persisted(entries: Vec<(RecordKey, MirrorEntry)>) -> Vec<PersistedEntry> {
    entries
        .into_iter()
        .map(|(key, entry)| PersistedEntry {
            key: key.external_id().to_string(),
            entry,
        })
        .collect()
}

/// Convert persisted entries back, dropping any whose key no longer
/// validates.
pub fn from_persisted(entries: Vec<PersistedEntry>) -> Vec<(RecordKey, MirrorEntry)> {
    entries
        .into_iter()
        .filter_map(|persisted| match RecordKey::resolve(&persisted.key) {
            Ok(key) => Some((key, persisted.entry)),
            Err(e) => {
                warn!(key = %persisted.key, error = %e, "dropping snapshot entry with invalid key");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MirrorSource;
    use crate::model::UserRecord;
    use chrono::Utc;

    fn entry() -> MirrorEntry {
        let key = RecordKey::resolve("123456789").unwrap();
        MirrorEntry {
            record: UserRecord::new(&key, Utc::now()),
            captured_at: Utc::now(),
            source: MirrorSource::Authoritative,
            version: 3,
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("mirror.json"));

        let persisted = vec![PersistedEntry {
            key: "123456789".to_string(),
            entry: entry(),
        }];
        store.save(&persisted).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, persisted);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("mirror.json"));

        store
            .save(&[PersistedEntry {
                key: "123456789".to_string(),
                entry: entry(),
            }])
            .await
            .unwrap();
        store.save(&[]).await.unwrap();

        assert!(store.load().await.unwrap().is_empty());
    }

    #[test]
    fn invalid_keys_are_dropped_on_load() {
        let restored = from_persisted(vec![
            PersistedEntry {
                key: "123456789".to_string(),
                entry: entry(),
            },
            PersistedEntry {
                key: "anon-123456".to_string(),
                entry: entry(),
            },
        ]);
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].0.external_id(), "123456789");
    }
}
