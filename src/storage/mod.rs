//! Storage module for persistent Automerge document snapshots using Sled.
//!
//! The document engine owns durability of its own binary representation;
//! relational projection happens separately in [`crate::projection`].

mod sled_store;

#[cfg(test)]
pub(crate) use sled_store::tests::temp_store;
pub use sled_store::{SnapshotStore, StorageError, StorageResult};

use serde::{Deserialize, Serialize};

use crate::sync::document::DOCUMENT_PRIMARY;

/// Metadata stored alongside each snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Document the snapshot belongs to
    pub document_id: String,
    /// Unix timestamp of the last write
    pub updated_at: i64,
    /// Size of the snapshot in bytes
    pub size_bytes: u64,
    /// `stateAuthority` declared by the document when it was saved
    pub state_authority: Option<String>,
}

impl SnapshotMeta {
    pub fn is_document_primary(&self) -> bool {
        self.state_authority.as_deref() == Some(DOCUMENT_PRIMARY)
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/graph-collab.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}
