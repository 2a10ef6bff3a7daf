//! Live document synchronization for the sync channel.
//!
//! This module provides:
//! - The Automerge wrapper holding a graph document
//! - The JSON wire protocol and close codes shared by all channels
//! - The sync server that owns open documents, merges client changes and
//!   flushes dirty documents into snapshots and relational projections

pub mod document;
pub mod protocol;
pub mod server;

pub use document::{DocumentError, DocumentMeta, DocumentState, GraphDocument, DOCUMENT_PRIMARY};
pub use server::{SyncRoom, SyncServer, SyncServerConfig, SyncStats};

use thiserror::Error;

use crate::db::DbError;
use crate::storage::StorageError;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Snapshot storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Relational store error: {0}")]
    Store(#[from] DbError),

    #[error("Sync frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Connection is read-only")]
    ReadOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        assert_eq!(SyncError::FrameTooLarge(42).to_string(), "Sync frame of 42 bytes exceeds the limit");
        assert_eq!(SyncError::ReadOnly.to_string(), "Connection is read-only");
    }
}
