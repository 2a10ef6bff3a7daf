//! Document-to-relational projection.
//!
//! One run reads the exported document, normalizes every record into a
//! canonical row, compares against the stored rows of the same document and
//! writes only the difference. Writes go out in this order:
//! 1. node upserts
//! 2. edge upserts
//! 3. edge deletes
//! 4. node deletes

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::rows::{EdgeRow, GraphSnapshot, NodeRow};
use crate::db::{delete_chunked, upsert_chunked, DbError, DbResult, RelationalStore, SelectQuery};
use crate::sync::document::DocumentState;

pub const NODES_TABLE: &str = "graph_nodes";
pub const EDGES_TABLE: &str = "graph_edges";

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Row encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Rows written by one projection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteCounts {
    pub nodes_upserted: usize,
    pub nodes_deleted: usize,
    pub edges_upserted: usize,
    pub edges_deleted: usize,
}

impl WriteCounts {
    pub fn total(&self) -> usize {
        self.nodes_upserted + self.nodes_deleted + self.edges_upserted + self.edges_deleted
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionReport {
    /// Relational state before the run
    pub previous: GraphSnapshot,
    /// Relational state after the run
    pub next: GraphSnapshot,
    pub counts: WriteCounts,
    /// Number of store requests issued
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionOutcome {
    /// The document does not own its data yet
    Skipped,
    /// Storage already matches the document
    Unchanged,
    Applied(ProjectionReport),
}

trait ProjectedRow: Clone + Serialize {
    fn id(&self) -> &str;
    fn same_content(&self, other: &Self) -> bool;
}

impl ProjectedRow for NodeRow {
    fn id(&self) -> &str {
        &self.id
    }

    fn same_content(&self, other: &Self) -> bool {
        NodeRow::same_content(self, other)
    }
}

impl ProjectedRow for EdgeRow {
    fn id(&self) -> &str {
        &self.id
    }

    fn same_content(&self, other: &Self) -> bool {
        EdgeRow::same_content(self, other)
    }
}

/// Delta for one entity kind
struct RowPlan<R> {
    upserts: Vec<R>,
    deletes: Vec<String>,
}

impl<R: ProjectedRow> RowPlan<R> {
    /// `present` holds every id the document carries, including records that
    /// failed to normalize; those are left untouched in storage.
    fn build(stored: &[R], current: Vec<R>, present: &HashSet<&str>) -> Self {
        let by_id: HashMap<&str, &R> = stored.iter().map(|r| (r.id(), r)).collect();
        let upserts = current
            .into_iter()
            .filter(|row| by_id.get(row.id()).map_or(true, |old| !old.same_content(row)))
            .collect();
        let deletes = stored
            .iter()
            .filter(|row| !present.contains(row.id()))
            .map(|row| row.id().to_string())
            .collect();
        Self { upserts, deletes }
    }

    fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    fn encoded(&self) -> Result<Vec<Value>, serde_json::Error> {
        self.upserts.iter().map(serde_json::to_value).collect()
    }

    /// Stored rows with this plan applied
    fn apply(&self, stored: &[R]) -> Vec<R> {
        let deleted: HashSet<&str> = self.deletes.iter().map(String::as_str).collect();
        let replaced: HashSet<&str> = self.upserts.iter().map(|r| r.id()).collect();
        stored
            .iter()
            .filter(|row| !deleted.contains(row.id()) && !replaced.contains(row.id()))
            .cloned()
            .chain(self.upserts.iter().cloned())
            .collect()
    }
}

/// Projects collaborative documents into `graph_nodes` / `graph_edges`
#[derive(Clone)]
pub struct ProjectionEngine {
    store: Arc<dyn RelationalStore>,
    batch_size: usize,
}

impl ProjectionEngine {
    pub fn new(store: Arc<dyn RelationalStore>, batch_size: usize) -> Self {
        Self { store, batch_size }
    }

    pub fn store(&self) -> &Arc<dyn RelationalStore> {
        &self.store
    }

    /// Current relational state of a document
    pub async fn load_snapshot(&self, document_id: Uuid) -> DbResult<GraphSnapshot> {
        let nodes = self
            .store
            .select(&SelectQuery::new(NODES_TABLE).eq("document_id", document_id))
            .await?;
        let edges = self
            .store
            .select(&SelectQuery::new(EDGES_TABLE).eq("document_id", document_id))
            .await?;

        Ok(GraphSnapshot::new(
            nodes.iter().filter_map(NodeRow::from_stored).collect(),
            edges.iter().filter_map(EdgeRow::from_stored).collect(),
        ))
    }

    pub async fn project(
        &self,
        document_id: Uuid,
        state: &DocumentState,
    ) -> Result<ProjectionOutcome, ProjectionError> {
        if !state.meta.is_document_primary() {
            debug!(%document_id, "Projection skipped, document is not primary");
            return Ok(ProjectionOutcome::Skipped);
        }

        let stored = self.load_snapshot(document_id).await?;
        let now = Utc::now();

        let stored_nodes: HashMap<&str, &NodeRow> = stored.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let nodes: Vec<NodeRow> = state
            .nodes_by_id
            .iter()
            .filter_map(|(id, record)| {
                NodeRow::from_record(id, record, document_id, stored_nodes.get(id.as_str()).copied(), now)
            })
            .collect();

        let stored_edges: HashMap<&str, &EdgeRow> = stored.edges.iter().map(|e| (e.id.as_str(), e)).collect();
        let edges: Vec<EdgeRow> = state
            .edges_by_id
            .iter()
            .filter_map(|(id, record)| {
                EdgeRow::from_record(id, record, document_id, stored_edges.get(id.as_str()).copied(), now)
            })
            .collect();

        let node_ids: HashSet<&str> = state.nodes_by_id.keys().map(String::as_str).collect();
        let edge_ids: HashSet<&str> = state.edges_by_id.keys().map(String::as_str).collect();
        let node_plan = RowPlan::build(&stored.nodes, nodes, &node_ids);
        let edge_plan = RowPlan::build(&stored.edges, edges, &edge_ids);

        if node_plan.is_empty() && edge_plan.is_empty() {
            return Ok(ProjectionOutcome::Unchanged);
        }

        let store = self.store.as_ref();
        let mut batches = 0;
        batches += upsert_chunked(store, NODES_TABLE, &node_plan.encoded()?, "id", self.batch_size).await?;
        batches += upsert_chunked(store, EDGES_TABLE, &edge_plan.encoded()?, "id", self.batch_size).await?;
        batches += delete_chunked(store, EDGES_TABLE, "id", &edge_plan.deletes, self.batch_size).await?;
        batches += delete_chunked(store, NODES_TABLE, "id", &node_plan.deletes, self.batch_size).await?;

        let counts = WriteCounts {
            nodes_upserted: node_plan.upserts.len(),
            nodes_deleted: node_plan.deletes.len(),
            edges_upserted: edge_plan.upserts.len(),
            edges_deleted: edge_plan.deletes.len(),
        };
        let next = GraphSnapshot::new(node_plan.apply(&stored.nodes), edge_plan.apply(&stored.edges));

        Ok(ProjectionOutcome::Applied(ProjectionReport {
            previous: stored,
            next,
            counts,
            batches,
        }))
    }
}
