//! Structural diff between two graph snapshots.
//!
//! Rows are compared as JSON objects. Nested objects are walked and changed
//! leaves are recorded under dotted paths; arrays, and objects whose keys
//! themselves contain a dot, are replaced whole. A `null` leaf is the same
//! as an absent one, so a `null` patch value means "remove this key".

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::{HistoryError, HistoryResult};
use crate::projection::rows::{is_banned, is_ephemeral, EdgeRow, GraphSnapshot, NodeRow};

/// Dotted path to value
pub type Patch = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryOperation {
    Add,
    Update,
    Delete,
    Batch,
}

impl HistoryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryOperation::Add => "add",
            HistoryOperation::Update => "update",
            HistoryOperation::Delete => "delete",
            HistoryOperation::Batch => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Node,
    Edge,
    Mixed,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Node => "node",
            EntityKind::Edge => "edge",
            EntityKind::Mixed => "mixed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Node,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Remove,
    Patch,
}

/// One entity-level change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOp {
    pub id: String,
    pub kind: RowKind,
    pub op: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_patch: Option<Patch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_patch: Option<Patch>,
}

/// Reversible description of one reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDelta {
    pub operation: HistoryOperation,
    pub entity_kind: EntityKind,
    pub changes: Vec<ChangeOp>,
}

/// Changes turning `previous` into `next`, or `None` when they are equal
pub fn diff(previous: &GraphSnapshot, next: &GraphSnapshot) -> HistoryResult<Option<HistoryDelta>> {
    let mut changes = diff_rows(RowKind::Node, &previous.nodes, &next.nodes)?;
    changes.extend(diff_rows(RowKind::Edge, &previous.edges, &next.edges)?);

    if changes.is_empty() {
        return Ok(None);
    }

    let operation = match changes.as_slice() {
        [single] => match single.op {
            ChangeKind::Add => HistoryOperation::Add,
            ChangeKind::Remove => HistoryOperation::Delete,
            ChangeKind::Patch => HistoryOperation::Update,
        },
        _ => HistoryOperation::Batch,
    };
    let entity_kind = if changes.iter().all(|c| c.kind == RowKind::Node) {
        EntityKind::Node
    } else if changes.iter().all(|c| c.kind == RowKind::Edge) {
        EntityKind::Edge
    } else {
        EntityKind::Mixed
    };

    Ok(Some(HistoryDelta {
        operation,
        entity_kind,
        changes,
    }))
}

fn rows_by_id<R: Serialize>(rows: &[R]) -> HistoryResult<BTreeMap<String, Map<String, Value>>> {
    let mut by_id = BTreeMap::new();
    for row in rows {
        if let Value::Object(map) = serde_json::to_value(row)? {
            if let Some(id) = map.get("id").and_then(Value::as_str) {
                by_id.insert(id.to_string(), map);
            }
        }
    }
    Ok(by_id)
}

fn diff_rows<R: Serialize>(kind: RowKind, previous: &[R], next: &[R]) -> HistoryResult<Vec<ChangeOp>> {
    let before = rows_by_id(previous)?;
    let after = rows_by_id(next)?;
    let ids: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

    let mut changes = Vec::new();
    for id in ids {
        let change = |op| ChangeOp {
            id: id.clone(),
            kind,
            op,
            value: None,
            removed_value: None,
            forward_patch: None,
            reverse_patch: None,
        };
        match (before.get(id), after.get(id)) {
            (None, Some(added)) => changes.push(ChangeOp {
                value: Some(Value::Object(added.clone())),
                ..change(ChangeKind::Add)
            }),
            (Some(removed), None) => changes.push(ChangeOp {
                removed_value: Some(Value::Object(removed.clone())),
                ..change(ChangeKind::Remove)
            }),
            (Some(old), Some(new)) => {
                let mut forward = Patch::new();
                let mut reverse = Patch::new();
                diff_objects("", old, new, &mut forward, &mut reverse);
                if !forward.is_empty() {
                    changes.push(ChangeOp {
                        forward_patch: Some(forward),
                        reverse_patch: Some(reverse),
                        ..change(ChangeKind::Patch)
                    });
                }
            }
            (None, None) => {}
        }
    }
    Ok(changes)
}

fn walkable(map: &Map<String, Value>) -> bool {
    map.keys().all(|k| !k.contains('.'))
}

fn diff_objects(
    prefix: &str,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
    forward: &mut Patch,
    reverse: &mut Patch,
) {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    for key in keys {
        if is_ephemeral(key) || is_banned(key) {
            continue;
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let old = before.get(key).filter(|v| !v.is_null());
        let new = after.get(key).filter(|v| !v.is_null());
        match (old, new) {
            (None, None) => {}
            (Some(Value::Object(a)), Some(Value::Object(b))) if walkable(a) && walkable(b) => {
                diff_objects(&path, a, b, forward, reverse);
            }
            (a, b) if a == b => {}
            (a, b) => {
                forward.insert(path.clone(), b.cloned().unwrap_or(Value::Null));
                reverse.insert(path, a.cloned().unwrap_or(Value::Null));
            }
        }
    }
}

/// Write `value` at a dotted path, creating intermediate objects; `null` removes the key
pub fn set_path(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = target;
    while let Some(segment) = segments.next() {
        if is_banned(segment) {
            return;
        }
        if segments.peek().is_none() {
            if value.is_null() {
                current.remove(segment);
            } else {
                current.insert(segment.to_string(), value);
            }
            return;
        }
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
}

/// Undo `delta` on the snapshot it produced
pub fn apply_reverse(next: &GraphSnapshot, delta: &HistoryDelta) -> HistoryResult<GraphSnapshot> {
    let mut nodes = rows_by_id(&next.nodes)?;
    let mut edges = rows_by_id(&next.edges)?;

    for change in delta.changes.iter().rev() {
        let rows = match change.kind {
            RowKind::Node => &mut nodes,
            RowKind::Edge => &mut edges,
        };
        match change.op {
            ChangeKind::Add => {
                rows.remove(&change.id);
            }
            ChangeKind::Remove => {
                let Some(Value::Object(removed)) = &change.removed_value else {
                    return Err(HistoryError::Malformed(format!("remove of {} carries no value", change.id)));
                };
                rows.insert(change.id.clone(), removed.clone());
            }
            ChangeKind::Patch => {
                let Some(row) = rows.get_mut(&change.id) else {
                    return Err(HistoryError::Malformed(format!("patch target {} is missing", change.id)));
                };
                for (path, value) in change.reverse_patch.iter().flatten() {
                    set_path(row, path, value.clone());
                }
            }
        }
    }

    Ok(GraphSnapshot::new(decode_rows::<NodeRow>(nodes)?, decode_rows::<EdgeRow>(edges)?))
}

fn decode_rows<R: DeserializeOwned>(rows: BTreeMap<String, Map<String, Value>>) -> HistoryResult<Vec<R>> {
    rows.into_values()
        .map(|row| serde_json::from_value(Value::Object(row)).map_err(HistoryError::from))
        .collect()
}
