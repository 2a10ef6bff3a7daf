//! Persists history deltas as an append-only event log.
//!
//! Tables:
//! - `graph_history_snapshots`: one baseline per document, index 0
//! - `graph_history_events`: one row per recorded delta
//! - `graph_history_current`: head pointer, upserted on `document_id`

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::diff::{diff, ChangeKind, EntityKind, HistoryDelta, RowKind};
use super::HistoryResult;
use crate::db::{RelationalStore, SelectQuery};
use crate::projection::rows::GraphSnapshot;
use crate::sync::document::DocumentMeta;

pub const SNAPSHOTS_TABLE: &str = "graph_history_snapshots";
pub const EVENTS_TABLE: &str = "graph_history_events";
pub const CURRENT_TABLE: &str = "graph_history_current";

/// What happened to one reconciliation's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded { snapshot_id: Uuid, event_id: Uuid, event_index: i64 },
    NoChanges,
    NoActor,
}

/// Label for an explicit mutation kind
pub fn mutation_label(kind: &str) -> Option<&'static str> {
    Some(match kind {
        "node-create" => "Added node",
        "node-update" => "Updated node",
        "node-delete" => "Deleted node",
        "edge-create" => "Added edge",
        "edge-update" => "Updated edge",
        "edge-delete" => "Deleted edge",
        "layout-apply" => "Applied layout",
        "history-revert" => "Reverted history",
        "bulk-import" => "Imported graph",
        _ => return None,
    })
}

/// Label inferred from the delta's shape
pub fn inferred_label(delta: &HistoryDelta) -> String {
    match delta.changes.as_slice() {
        [single] => {
            let verb = match single.op {
                ChangeKind::Add => "Added",
                ChangeKind::Remove => "Deleted",
                ChangeKind::Patch => "Updated",
            };
            let noun = match single.kind {
                RowKind::Node => "node",
                RowKind::Edge => "edge",
            };
            format!("{} {}", verb, noun)
        }
        changes => {
            let noun = match delta.entity_kind {
                EntityKind::Node => "nodes",
                EntityKind::Edge => "edges",
                EntityKind::Mixed => "items",
            };
            format!("Changed {} {}", changes.len(), noun)
        }
    }
}

pub fn action_label(meta: &DocumentMeta, delta: &HistoryDelta) -> String {
    meta.last_mutation_kind
        .as_deref()
        .and_then(mutation_label)
        .map(str::to_string)
        .unwrap_or_else(|| inferred_label(delta))
}

/// Owner id embedded in any change payload
fn embedded_owner(delta: &HistoryDelta) -> Option<Uuid> {
    delta.changes.iter().find_map(|change| {
        let from_row = |row: &Option<Value>| {
            row.as_ref()
                .and_then(|r| r.get("owner_user_id"))
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
        };
        from_row(&change.value)
            .or_else(|| from_row(&change.removed_value))
            .or_else(|| {
                change
                    .forward_patch
                    .as_ref()
                    .and_then(|p| p.get("owner_user_id"))
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok())
            })
    })
}

#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn RelationalStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }

    /// Actor to attribute: explicit marker, then embedded owner, then document owner
    pub async fn resolve_actor(
        &self,
        document_id: Uuid,
        meta: &DocumentMeta,
        delta: &HistoryDelta,
    ) -> HistoryResult<Option<Uuid>> {
        if let Some(actor) = meta.last_actor_id.as_deref().and_then(|s| Uuid::parse_str(s).ok()) {
            return Ok(Some(actor));
        }
        if let Some(owner) = embedded_owner(delta) {
            return Ok(Some(owner));
        }
        let rows = self
            .store
            .select(
                &SelectQuery::new("documents")
                    .columns("owner_id")
                    .eq("id", document_id)
                    .limit(1),
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("owner_id"))
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok()))
    }

    /// Record the change from `previous` to `next`
    pub async fn record(
        &self,
        document_id: Uuid,
        meta: &DocumentMeta,
        previous: &GraphSnapshot,
        next: &GraphSnapshot,
    ) -> HistoryResult<RecordOutcome> {
        let Some(delta) = diff(previous, next)? else {
            debug!(%document_id, "No history changes");
            return Ok(RecordOutcome::NoChanges);
        };

        let Some(actor_id) = self.resolve_actor(document_id, meta, &delta).await? else {
            info!(%document_id, "History event skipped, no resolvable actor");
            return Ok(RecordOutcome::NoActor);
        };

        let snapshot_id = self.baseline(document_id, previous, actor_id).await?;
        let event_index = self.next_event_index(snapshot_id).await?;
        let event_id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let action = action_label(meta, &delta);

        self.store
            .insert(
                EVENTS_TABLE,
                &[json!({
                    "id": event_id,
                    "document_id": document_id,
                    "snapshot_id": snapshot_id,
                    "event_index": event_index,
                    "actor_id": actor_id,
                    "action": &action,
                    "operation": delta.operation.as_str(),
                    "entity_kind": delta.entity_kind.as_str(),
                    "changes": serde_json::to_value(&delta.changes)?,
                    "created_at": now,
                })],
            )
            .await?;

        self.store
            .upsert(
                CURRENT_TABLE,
                &[json!({
                    "document_id": document_id,
                    "snapshot_id": snapshot_id,
                    "event_id": event_id,
                    "actor_id": actor_id,
                    "updated_at": now,
                })],
                "document_id",
            )
            .await?;

        info!(
            %document_id,
            %event_id,
            event_index,
            action = %action,
            changes = delta.changes.len(),
            "History event recorded"
        );
        Ok(RecordOutcome::Recorded {
            snapshot_id,
            event_id,
            event_index,
        })
    }

    /// Id of the document's baseline, creating it from `previous` if missing
    async fn baseline(&self, document_id: Uuid, previous: &GraphSnapshot, actor_id: Uuid) -> HistoryResult<Uuid> {
        let existing = self
            .store
            .select(
                &SelectQuery::new(SNAPSHOTS_TABLE)
                    .columns("id")
                    .eq("document_id", document_id)
                    .order("snapshot_index", false)
                    .limit(1),
            )
            .await?;
        if let Some(id) = existing
            .first()
            .and_then(|row| row.get("id"))
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            return Ok(id);
        }

        let snapshot_id = Uuid::new_v4();
        self.store
            .insert(
                SNAPSHOTS_TABLE,
                &[json!({
                    "id": snapshot_id,
                    "document_id": document_id,
                    "snapshot_index": 0,
                    "nodes": serde_json::to_value(&previous.nodes)?,
                    "edges": serde_json::to_value(&previous.edges)?,
                    "created_by": actor_id,
                    "created_at": Utc::now().to_rfc3339(),
                })],
            )
            .await?;
        debug!(%document_id, %snapshot_id, "History baseline created");
        Ok(snapshot_id)
    }

    async fn next_event_index(&self, snapshot_id: Uuid) -> HistoryResult<i64> {
        let latest = self
            .store
            .select(
                &SelectQuery::new(EVENTS_TABLE)
                    .columns("event_index")
                    .eq("snapshot_id", snapshot_id)
                    .order("event_index", true)
                    .limit(1),
            )
            .await?;
        Ok(latest
            .first()
            .and_then(|row| row.get("event_index"))
            .and_then(Value::as_i64)
            .map_or(1, |index| index + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, WriteOp};
    use crate::history::diff::HistoryOperation;
    use crate::projection::rows::NodeRow;
    use serde_json::Map;

    fn node(id: &str, x: f64, owner: Option<Uuid>) -> NodeRow {
        let at = "2024-01-01T00:00:00Z".parse().unwrap();
        NodeRow {
            id: id.to_string(),
            document_id: Uuid::nil(),
            owner_user_id: owner,
            node_type: "task".to_string(),
            position_x: x,
            position_y: 0.0,
            width: None,
            height: None,
            label: None,
            data: Map::new(),
            created_at: at,
            updated_at: at,
        }
    }

    fn setup() -> (Arc<MemoryStore>, HistoryRecorder) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), HistoryRecorder::new(store))
    }

    #[tokio::test]
    async fn test_first_event_creates_baseline_and_head() {
        let (store, recorder) = setup();
        let document_id = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let meta = DocumentMeta {
            last_actor_id: Some(actor.to_string()),
            last_mutation_kind: Some("node-create".into()),
            ..Default::default()
        };

        let previous = GraphSnapshot::new(vec![node("a", 0.0, None)], vec![]);
        let next = GraphSnapshot::new(vec![node("a", 0.0, None), node("b", 1.0, None)], vec![]);
        let outcome = recorder.record(document_id, &meta, &previous, &next).await.unwrap();

        let (snapshot_id, event_id, event_index) = match outcome {
            RecordOutcome::Recorded {
                snapshot_id,
                event_id,
                event_index,
            } => (snapshot_id, event_id, event_index),
            other => panic!("expected an event, got {:?}", other),
        };
        assert_eq!(event_index, 1);

        let baselines = store.rows(SNAPSHOTS_TABLE);
        assert_eq!(baselines.len(), 1);
        assert_eq!(baselines[0]["snapshot_index"], 0);
        assert_eq!(baselines[0]["nodes"].as_array().unwrap().len(), 1);

        let events = store.rows(EVENTS_TABLE);
        assert_eq!(events[0]["action"], "Added node");
        assert_eq!(events[0]["operation"], "add");
        assert_eq!(events[0]["actor_id"], actor.to_string());
        assert_eq!(events[0]["snapshot_id"], snapshot_id.to_string());

        let head = store.rows(CURRENT_TABLE);
        assert_eq!(head.len(), 1);
        assert_eq!(head[0]["event_id"], event_id.to_string());
    }

    #[tokio::test]
    async fn test_event_index_increases_and_baseline_is_reused() {
        let (store, recorder) = setup();
        let document_id = Uuid::new_v4();
        let meta = DocumentMeta {
            last_actor_id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        };

        let s0 = GraphSnapshot::new(vec![node("a", 0.0, None)], vec![]);
        let s1 = GraphSnapshot::new(vec![node("a", 1.0, None)], vec![]);
        let s2 = GraphSnapshot::new(vec![node("a", 2.0, None)], vec![]);
        recorder.record(document_id, &meta, &s0, &s1).await.unwrap();
        let second = recorder.record(document_id, &meta, &s1, &s2).await.unwrap();

        assert!(matches!(second, RecordOutcome::Recorded { event_index: 2, .. }));
        assert_eq!(store.rows(SNAPSHOTS_TABLE).len(), 1);
        assert_eq!(store.rows(EVENTS_TABLE).len(), 2);
        assert_eq!(store.rows(CURRENT_TABLE).len(), 1);
        assert_eq!(store.rows(EVENTS_TABLE)[1]["action"], "Updated node");
    }

    #[tokio::test]
    async fn test_actor_falls_back_to_embedded_owner_then_document_owner() {
        let (store, recorder) = setup();
        let document_id = Uuid::new_v4();
        let meta = DocumentMeta::default();
        let embedded = Uuid::new_v4();

        let previous = GraphSnapshot::default();
        let next = GraphSnapshot::new(vec![node("a", 0.0, Some(embedded))], vec![]);
        let delta = diff(&previous, &next).unwrap().unwrap();
        assert_eq!(
            recorder.resolve_actor(document_id, &meta, &delta).await.unwrap(),
            Some(embedded)
        );

        let owner = Uuid::new_v4();
        store.seed(
            "documents",
            vec![json!({"id": document_id.to_string(), "owner_id": owner.to_string()})],
        );
        let next = GraphSnapshot::new(vec![node("a", 0.0, None)], vec![]);
        let delta = diff(&previous, &next).unwrap().unwrap();
        assert_eq!(
            recorder.resolve_actor(document_id, &meta, &delta).await.unwrap(),
            Some(owner)
        );
    }

    #[tokio::test]
    async fn test_unattributable_change_is_skipped() {
        let (store, recorder) = setup();
        let previous = GraphSnapshot::default();
        let next = GraphSnapshot::new(vec![node("a", 0.0, None)], vec![]);

        let outcome = recorder
            .record(Uuid::new_v4(), &DocumentMeta::default(), &previous, &next)
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::NoActor);
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_identical_snapshots_record_nothing() {
        let (store, recorder) = setup();
        let snapshot = GraphSnapshot::new(vec![node("a", 0.0, None)], vec![]);
        let outcome = recorder
            .record(Uuid::new_v4(), &DocumentMeta::default(), &snapshot, &snapshot)
            .await
            .unwrap();
        assert_eq!(outcome, RecordOutcome::NoChanges);
        assert!(store.writes().is_empty());
    }

    #[test]
    fn test_labels() {
        assert_eq!(mutation_label("layout-apply"), Some("Applied layout"));
        assert_eq!(mutation_label("teleport"), None);

        let previous = GraphSnapshot::default();
        let next = GraphSnapshot::new(vec![node("a", 0.0, None), node("b", 0.0, None)], vec![]);
        let delta = diff(&previous, &next).unwrap().unwrap();
        assert_eq!(delta.operation, HistoryOperation::Batch);
        assert_eq!(inferred_label(&delta), "Changed 2 nodes");

        let meta = DocumentMeta {
            last_mutation_kind: Some("unknown-kind".into()),
            ..Default::default()
        };
        assert_eq!(action_label(&meta, &delta), "Changed 2 nodes");
    }

    #[tokio::test]
    async fn test_written_event_rows_use_expected_tables() {
        let (store, recorder) = setup();
        let meta = DocumentMeta {
            last_actor_id: Some(Uuid::new_v4().to_string()),
            ..Default::default()
        };
        let next = GraphSnapshot::new(vec![node("a", 0.0, None)], vec![]);
        recorder
            .record(Uuid::new_v4(), &meta, &GraphSnapshot::default(), &next)
            .await
            .unwrap();

        let tables: Vec<String> = store.writes().iter().map(|w| w.table().to_string()).collect();
        assert_eq!(tables, vec![SNAPSHOTS_TABLE, EVENTS_TABLE, CURRENT_TABLE]);
        assert!(matches!(store.writes()[2], WriteOp::Upsert { ref on_conflict, .. } if on_conflict == "document_id"));
    }
}
