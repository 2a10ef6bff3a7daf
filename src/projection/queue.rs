//! Per-document serialization of background reconciliation work.
//!
//! Each document with pending work owns a lane: an unbounded channel drained
//! by a single worker task. Jobs for one document therefore run one at a
//! time in submission order while different documents proceed in parallel.
//! A job that panics is reported and the lane moves on to the next one. The
//! lane is dropped once it drains, unless new work arrived in the meantime.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// How a queued job settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Panicked,
}

struct Task {
    job: Job,
    done: oneshot::Sender<JobOutcome>,
}

#[derive(Clone)]
struct Lane {
    tx: mpsc::UnboundedSender<Task>,
    pending: Arc<AtomicUsize>,
}

/// FIFO job queue keyed by document id
#[derive(Clone, Default)]
pub struct ProjectionQueue {
    lanes: Arc<DashMap<Uuid, Lane>>,
}

impl ProjectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a job behind every earlier job of the same document.
    ///
    /// The receiver resolves once the job has settled.
    pub fn enqueue<F>(&self, document_id: Uuid, job: F) -> oneshot::Receiver<JobOutcome>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done, settled) = oneshot::channel();
        let task = Task {
            job: Box::pin(job),
            done,
        };

        // The entry guard keeps the worker from retiring the lane between
        // the pending increment and the send.
        match self.lanes.entry(document_id) {
            Entry::Occupied(entry) => {
                let lane = entry.get();
                lane.pending.fetch_add(1, Ordering::AcqRel);
                if lane.tx.send(task).is_err() {
                    lane.pending.fetch_sub(1, Ordering::AcqRel);
                    warn!(%document_id, "Projection lane worker is gone, job dropped");
                }
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let pending = Arc::new(AtomicUsize::new(1));
                let _ = tx.send(task);
                entry.insert(Lane {
                    tx,
                    pending: pending.clone(),
                });
                tokio::spawn(run_lane(self.lanes.clone(), document_id, rx, pending));
            }
        }
        settled
    }

    /// Jobs queued or running across all documents
    pub fn pending_count(&self) -> usize {
        self.lanes
            .iter()
            .map(|lane| lane.pending.load(Ordering::Acquire))
            .sum()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

async fn run_lane(
    lanes: Arc<DashMap<Uuid, Lane>>,
    document_id: Uuid,
    mut rx: mpsc::UnboundedReceiver<Task>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(Task { job, done }) = rx.recv().await {
        let outcome = match AssertUnwindSafe(job).catch_unwind().await {
            Ok(()) => JobOutcome::Completed,
            Err(_) => {
                error!(%document_id, stage = "queue", "Projection job panicked");
                JobOutcome::Panicked
            }
        };

        let retired = pending.fetch_sub(1, Ordering::AcqRel) == 1
            && lanes
                .remove_if(&document_id, |_, lane| {
                    Arc::ptr_eq(&lane.pending, &pending) && lane.pending.load(Ordering::Acquire) == 0
                })
                .is_some();

        let _ = done.send(outcome);
        if retired {
            debug!(%document_id, "Projection lane drained");
            break;
        }
    }
}
