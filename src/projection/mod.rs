//! CRDT-to-relational projection.
//!
//! - [`rows`]: canonical node/edge rows
//! - [`ProjectionEngine`]: minimal-write reconciliation of one document
//! - [`ProjectionQueue`]: one-at-a-time execution per document
//! - [`Reconciler`]: projection followed by history, failures logged

mod engine;
mod queue;
pub mod rows;

pub use engine::{
    ProjectionEngine, ProjectionError, ProjectionOutcome, ProjectionReport, WriteCounts, EDGES_TABLE, NODES_TABLE,
};
pub use queue::{JobOutcome, ProjectionQueue};

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::history::HistoryRecorder;
use crate::sync::document::DocumentState;

/// Runs one reconciliation end to end. Never fails; every error is logged
/// with the document id and the stage that produced it.
#[derive(Clone)]
pub struct Reconciler {
    engine: ProjectionEngine,
    history: HistoryRecorder,
}

impl Reconciler {
    pub fn new(engine: ProjectionEngine, history: HistoryRecorder) -> Self {
        Self { engine, history }
    }

    pub fn engine(&self) -> &ProjectionEngine {
        &self.engine
    }

    pub async fn reconcile(&self, document_id: Uuid, state: DocumentState) {
        let report = match self.engine.project(document_id, &state).await {
            Ok(ProjectionOutcome::Applied(report)) => report,
            Ok(ProjectionOutcome::Unchanged) => {
                debug!(%document_id, "Projection found no changes");
                return;
            }
            Ok(ProjectionOutcome::Skipped) => return,
            Err(e) => {
                error!(%document_id, stage = "projection", error = %e, "Reconciliation failed");
                return;
            }
        };

        info!(
            %document_id,
            upserted = report.counts.nodes_upserted + report.counts.edges_upserted,
            deleted = report.counts.nodes_deleted + report.counts.edges_deleted,
            batches = report.batches,
            "Projection applied"
        );

        if let Err(e) = self
            .history
            .record(document_id, &state.meta, &report.previous, &report.next)
            .await
        {
            error!(%document_id, stage = "history", error = %e, "Reconciliation failed");
        }
    }
}
