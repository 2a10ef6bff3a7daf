//! SyncServer implementation for managing live graph documents.
//!
//! This module implements the sync-channel backend using:
//! - DashMap for concurrent access to open documents
//! - Automerge for merging concurrent edits from every connection
//! - Sled snapshots for the document's own binary representation
//! - The projection queue for relational reconciliation of dirty documents
//!
//! A room stays in memory while at least one sync connection holds it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::document::{DocumentResult, DocumentState, GraphDocument};
use super::protocol::MAX_SYNC_FRAME;
use super::{SyncError, SyncResult};
use crate::projection::{JobOutcome, ProjectionQueue, Reconciler};
use crate::storage::SnapshotStore;

/// Configuration for the SyncServer
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Cadence of the dirty-document flush
    pub flush_interval: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
        }
    }
}

/// One open document shared by all sync connections of a room
pub struct SyncRoom {
    document_id: Uuid,
    doc: Mutex<GraphDocument>,
    dirty: AtomicBool,
}

impl SyncRoom {
    fn new(document_id: Uuid, doc: GraphDocument) -> Self {
        Self {
            document_id,
            doc: Mutex::new(doc),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    /// Full document for a joining connection
    pub fn snapshot(&self) -> Vec<u8> {
        self.doc.lock().save()
    }

    /// Hand the full document to `f` while merges are held off
    pub fn with_snapshot<R>(&self, f: impl FnOnce(Vec<u8>) -> R) -> R {
        let mut doc = self.doc.lock();
        let bytes = doc.save();
        f(bytes)
    }

    /// Merge change bytes from a connection
    pub fn apply(&self, bytes: &[u8]) -> SyncResult<usize> {
        if bytes.len() > MAX_SYNC_FRAME {
            return Err(SyncError::FrameTooLarge(bytes.len()));
        }
        let applied = self.doc.lock().apply_incremental(bytes)?;
        self.dirty.store(true, Ordering::Release);
        Ok(applied)
    }

    /// Merge change bytes from a connection that may lack edit rights
    pub fn apply_from(&self, can_edit: bool, bytes: &[u8]) -> SyncResult<usize> {
        if !can_edit {
            return Err(SyncError::ReadOnly);
        }
        self.apply(bytes)
    }

    pub fn state(&self) -> SyncResult<DocumentState> {
        Ok(self.doc.lock().export_state()?)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Run `export` on a dirty document and clear the flag. The flag is
    /// restored when `export` fails, so the edits are retried on the next
    /// flush and the room is not evicted meanwhile.
    fn take_export<T>(
        &self,
        export: impl FnOnce(&mut GraphDocument) -> DocumentResult<T>,
    ) -> Option<DocumentResult<T>> {
        let mut doc = self.doc.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return None;
        }
        let result = export(&mut *doc);
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        Some(result)
    }
}

/// Statistics about the sync server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub active_rooms: usize,
    pub dirty_rooms: usize,
}

/// Owner of every open graph document
pub struct SyncServer {
    rooms: DashMap<Uuid, Arc<SyncRoom>>,
    snapshots: SnapshotStore,
    reconciler: Reconciler,
    queue: ProjectionQueue,
    config: SyncServerConfig,
}

impl SyncServer {
    pub fn new(
        snapshots: SnapshotStore,
        reconciler: Reconciler,
        queue: ProjectionQueue,
        config: SyncServerConfig,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            snapshots,
            reconciler,
            queue,
            config,
        }
    }

    /// Open (or join) the room of a document
    pub async fn open(&self, document_id: Uuid) -> SyncResult<Arc<SyncRoom>> {
        if let Some(room) = self.rooms.get(&document_id) {
            return Ok(room.clone());
        }

        let document = self.load_document(document_id).await?;
        let room = Arc::new(SyncRoom::new(document_id, document));
        // A concurrent open may have won; its room is the one everyone shares.
        Ok(self.rooms.entry(document_id).or_insert(room).clone())
    }

    /// Snapshot if it declares the document primary, relational rows otherwise
    async fn load_document(&self, document_id: Uuid) -> SyncResult<GraphDocument> {
        let primary = self
            .snapshots
            .snapshot_meta(document_id)?
            .map_or(false, |meta| meta.is_document_primary());

        if primary {
            if let Some(bytes) = self.snapshots.load_snapshot(document_id)? {
                debug!(%document_id, size = bytes.len(), "Loading document from snapshot");
                return Ok(GraphDocument::load(&bytes)?);
            }
        }

        let rows = self.reconciler.engine().load_snapshot(document_id).await?;
        info!(
            %document_id,
            nodes = rows.nodes.len(),
            edges = rows.edges.len(),
            "Seeding document from relational rows"
        );
        Ok(GraphDocument::seed(&rows.nodes, &rows.edges)?)
    }

    /// Drop a connection's hold on a room, evicting it when nobody else holds it
    pub fn release(&self, room: Arc<SyncRoom>) {
        let document_id = room.document_id();
        self.flush_room(&room);
        drop(room);

        if self
            .rooms
            .remove_if(&document_id, |_, room| Arc::strong_count(room) == 1 && !room.is_dirty())
            .is_some()
        {
            info!(%document_id, "Sync room closed");
        }
    }

    /// Persist a dirty room and queue its reconciliation
    pub fn flush_room(&self, room: &SyncRoom) -> Option<oneshot::Receiver<JobOutcome>> {
        self.flush_with(room, |doc| {
            let state = doc.export_state()?;
            Ok((doc.save(), state))
        })
    }

    fn flush_with(
        &self,
        room: &SyncRoom,
        export: impl FnOnce(&mut GraphDocument) -> DocumentResult<(Vec<u8>, DocumentState)>,
    ) -> Option<oneshot::Receiver<JobOutcome>> {
        let document_id = room.document_id();
        let (bytes, state) = match room.take_export(export)? {
            Ok(exported) => exported,
            Err(e) => {
                error!(%document_id, stage = "snapshot", error = %e, "Document export failed");
                return None;
            }
        };

        if let Err(e) = self
            .snapshots
            .save_snapshot(document_id, &bytes, state.meta.state_authority.as_deref())
        {
            error!(%document_id, stage = "snapshot", error = %e, "Snapshot write failed");
        }

        let reconciler = self.reconciler.clone();
        Some(self.queue.enqueue(document_id, async move {
            reconciler.reconcile(document_id, state).await;
        }))
    }

    /// Flush every dirty room and drop rooms nobody holds. Returns the number flushed.
    pub fn flush_dirty(&self) -> usize {
        let dirty: Vec<Arc<SyncRoom>> = self
            .rooms
            .iter()
            .filter(|room| room.is_dirty())
            .map(|room| room.value().clone())
            .collect();

        let flushed = dirty.iter().filter(|room| self.flush_room(room).is_some()).count();
        drop(dirty);

        self.rooms
            .retain(|_, room| Arc::strong_count(room) > 1 || room.is_dirty());
        flushed
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            active_rooms: self.rooms.len(),
            dirty_rooms: self.rooms.iter().filter(|room| room.is_dirty()).count(),
        }
    }

    pub fn queue(&self) -> &ProjectionQueue {
        &self.queue
    }

    /// Flush snapshots to disk
    pub fn shutdown(&self) {
        let flushed = self.flush_dirty();
        if let Err(e) = self.snapshots.flush() {
            error!(stage = "snapshot", error = %e, "Final snapshot flush failed");
        }
        info!(flushed, "Sync server flushed");
    }

    /// Start the periodic flush task
    pub fn start_flush_loop(self: Arc<Self>) -> JoinHandle<()> {
        let interval = self.config.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let flushed = self.flush_dirty();
                if flushed > 0 {
                    debug!(flushed, "Flushed dirty documents");
                }
            }
        })
    }
}
