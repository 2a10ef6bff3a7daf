//! Sled-based snapshot store for graph documents.
//!
//! Binary Automerge snapshots live in one tree keyed by document id; a
//! second tree carries bincode-encoded [`SnapshotMeta`] so the loader can
//! check the declared state authority without decoding the document.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::{SnapshotMeta, StorageConfig};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_SNAPSHOTS: &str = "snapshots";
const TREE_META: &str = "snapshot_meta";

/// Durable home of the document engine's own representation
#[derive(Clone)]
pub struct SnapshotStore {
    db: Arc<Db>,
    snapshots: Tree,
    meta: Tree,
}

impl SnapshotStore {
    /// Open or create a store at the configured path
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(Some(config.flush_interval_ms).filter(|ms| *ms > 0))
            .open()?;

        Ok(Self {
            snapshots: db.open_tree(TREE_SNAPSHOTS)?,
            meta: db.open_tree(TREE_META)?,
            db: Arc::new(db),
        })
    }

    /// Store a full snapshot, replacing any previous one
    pub fn save_snapshot(
        &self,
        document_id: Uuid,
        bytes: &[u8],
        state_authority: Option<&str>,
    ) -> StorageResult<()> {
        let key = document_id.as_bytes();
        let meta = SnapshotMeta {
            document_id: document_id.to_string(),
            updated_at: chrono::Utc::now().timestamp(),
            size_bytes: bytes.len() as u64,
            state_authority: state_authority.map(str::to_string),
        };

        self.snapshots.insert(key, bytes)?;
        self.meta.insert(key, bincode::serialize(&meta)?)?;
        Ok(())
    }

    pub fn load_snapshot(&self, document_id: Uuid) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .snapshots
            .get(document_id.as_bytes())?
            .map(|data| data.to_vec()))
    }

    pub fn snapshot_meta(&self, document_id: Uuid) -> StorageResult<Option<SnapshotMeta>> {
        match self.meta.get(document_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for SnapshotStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.db.flush();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Store in a fresh temporary directory; keep the guard alive with it
    pub fn temp_store() -> (SnapshotStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        (SnapshotStore::open(&config).unwrap(), dir)
    }

    #[test]
    fn test_snapshot_save_load() {
        let (store, _dir) = temp_store();
        let id = Uuid::new_v4();

        store.save_snapshot(id, b"automerge bytes", Some("document_primary")).unwrap();
        assert_eq!(store.load_snapshot(id).unwrap().unwrap(), b"automerge bytes");

        let meta = store.snapshot_meta(id).unwrap().unwrap();
        assert_eq!(meta.size_bytes, 15);
        assert!(meta.is_document_primary());
    }

    #[test]
    fn test_snapshot_not_found() {
        let (store, _dir) = temp_store();
        assert!(store.load_snapshot(Uuid::new_v4()).unwrap().is_none());
        assert!(store.snapshot_meta(Uuid::new_v4()).unwrap().is_none());
    }
}
