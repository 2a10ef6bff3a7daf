//! Canonical relational rows for graph nodes and edges.
//!
//! Every value that reaches a diff passes through [`canonical_value`] first:
//! UI-only keys and unsafe key names are dropped, nulls inside objects are
//! removed and object keys come out sorted, so two independently produced
//! rows for the same logical state compare equal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Keys carrying transient editor state that must never reach storage
pub const EPHEMERAL_KEYS: &[&str] = &[
    "selected",
    "dragging",
    "resizing",
    "measured",
    "positionAbsolute",
    "dragHandle",
    "focused",
    "internals",
    "handleBounds",
    "__rf",
];

/// Key names skipped everywhere
pub const BANNED_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

pub fn is_ephemeral(key: &str) -> bool {
    EPHEMERAL_KEYS.contains(&key)
}

pub fn is_banned(key: &str) -> bool {
    BANNED_KEYS.contains(&key)
}

/// Canonical form of an arbitrary JSON value
pub fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(canonical_map(map)),
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

fn canonical_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(k, v)| !is_banned(k) && !is_ephemeral(k) && !v.is_null())
        .map(|(k, v)| (k.clone(), canonical_value(v)))
        .collect()
}

fn canonical_data(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => canonical_map(map),
        _ => Map::new(),
    }
}

/// Finite number from a JSON number or numeric string
pub fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// RFC 3339 string or epoch milliseconds
pub fn coerce_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

fn text(record: &Value, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn uuid_field(record: &Value, keys: &[&str]) -> Option<Uuid> {
    keys.iter()
        .find_map(|k| record.get(*k).and_then(Value::as_str))
        .and_then(|s| Uuid::parse_str(s).ok())
}

fn number_field(record: &Value, key: &str) -> Option<f64> {
    record.get(key).and_then(coerce_number)
}

/// Nodes without a top-level label fall back to `data.label`
fn data_label(data: &Map<String, Value>) -> Option<String> {
    data.get("label").and_then(Value::as_str).map(str::to_string)
}

fn timestamp_field(record: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter().find_map(|k| record.get(*k).and_then(coerce_timestamp))
}

/// Canonical relational shape of a graph node (`graph_nodes`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: String,
    pub document_id: Uuid,
    #[serde(default)]
    pub owner_user_id: Option<Uuid>,
    pub node_type: String,
    pub position_x: f64,
    pub position_y: f64,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRow {
    /// Normalize a document record. `stored` supplies values the record may
    /// omit (owner, creation time).
    pub fn from_record(
        key: &str,
        record: &Value,
        document_id: Uuid,
        stored: Option<&NodeRow>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if !record.is_object() || key.is_empty() || is_banned(key) {
            return None;
        }
        let data = canonical_data(record.get("data"));
        let position = record.get("position");
        let axis = |axis: &str, flat: &str| {
            position
                .and_then(|p| p.get(axis))
                .and_then(coerce_number)
                .or_else(|| number_field(record, flat))
                .unwrap_or(0.0)
        };

        Some(Self {
            id: key.to_string(),
            document_id,
            owner_user_id: uuid_field(record, &["ownerUserId", "ownerId"])
                .or_else(|| stored.and_then(|s| s.owner_user_id)),
            node_type: text(record, "type").unwrap_or_else(|| "default".to_string()),
            position_x: axis("x", "positionX"),
            position_y: axis("y", "positionY"),
            width: number_field(record, "width"),
            height: number_field(record, "height"),
            label: text(record, "label").or_else(|| data_label(&data)),
            created_at: stored
                .map(|s| s.created_at)
                .or_else(|| timestamp_field(record, &["createdAt"]))
                .unwrap_or(now),
            updated_at: timestamp_field(record, &["updatedAt"]).unwrap_or(now),
            data,
        })
    }

    /// Read a row as returned by the store
    pub fn from_stored(row: &Value) -> Option<Self> {
        let id = text(row, "id")?;
        let document_id = uuid_field(row, &["document_id"])?;
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        let data = canonical_data(row.get("data"));
        Some(Self {
            id,
            document_id,
            owner_user_id: uuid_field(row, &["owner_user_id"]),
            node_type: text(row, "node_type").unwrap_or_else(|| "default".to_string()),
            position_x: number_field(row, "position_x").unwrap_or(0.0),
            position_y: number_field(row, "position_y").unwrap_or(0.0),
            width: number_field(row, "width"),
            height: number_field(row, "height"),
            label: text(row, "label").or_else(|| data_label(&data)),
            data,
            created_at: timestamp_field(row, &["created_at"]).unwrap_or(epoch),
            updated_at: timestamp_field(row, &["updated_at"]).unwrap_or(epoch),
        })
    }

    /// Field-wise equality ignoring timestamps
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.document_id == other.document_id
            && self.owner_user_id == other.owner_user_id
            && self.node_type == other.node_type
            && self.position_x == other.position_x
            && self.position_y == other.position_y
            && self.width == other.width
            && self.height == other.height
            && self.label == other.label
            && self.data == other.data
    }

    /// Record shape written into a freshly seeded document
    pub fn to_record(&self) -> Value {
        let mut record = Map::new();
        record.insert("id".into(), Value::String(self.id.clone()));
        record.insert("type".into(), Value::String(self.node_type.clone()));
        record.insert(
            "position".into(),
            serde_json::json!({"x": self.position_x, "y": self.position_y}),
        );
        if let Some(width) = self.width {
            record.insert("width".into(), width.into());
        }
        if let Some(height) = self.height {
            record.insert("height".into(), height.into());
        }
        if let Some(label) = &self.label {
            record.insert("label".into(), Value::String(label.clone()));
        }
        if let Some(owner) = self.owner_user_id {
            record.insert("ownerUserId".into(), Value::String(owner.to_string()));
        }
        record.insert("data".into(), Value::Object(self.data.clone()));
        record.insert("createdAt".into(), Value::String(self.created_at.to_rfc3339()));
        record.insert("updatedAt".into(), Value::String(self.updated_at.to_rfc3339()));
        Value::Object(record)
    }
}

/// Canonical relational shape of a graph edge (`graph_edges`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRow {
    pub id: String,
    pub document_id: Uuid,
    #[serde(default)]
    pub owner_user_id: Option<Uuid>,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub edge_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EdgeRow {
    /// Normalize a document record; records without both endpoints are rejected
    pub fn from_record(
        key: &str,
        record: &Value,
        document_id: Uuid,
        stored: Option<&EdgeRow>,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if !record.is_object() || key.is_empty() || is_banned(key) {
            return None;
        }
        let source_id = text(record, "source").or_else(|| text(record, "sourceId"))?;
        let target_id = text(record, "target").or_else(|| text(record, "targetId"))?;

        let mut data = canonical_data(record.get("data"));
        for handle in ["sourceHandle", "targetHandle"] {
            if let Some(value) = text(record, handle) {
                data.insert(handle.to_string(), Value::String(value));
            }
        }

        Some(Self {
            id: key.to_string(),
            document_id,
            owner_user_id: uuid_field(record, &["ownerUserId", "ownerId"])
                .or_else(|| stored.and_then(|s| s.owner_user_id)),
            source_id,
            target_id,
            edge_type: text(record, "type"),
            label: text(record, "label"),
            created_at: stored
                .map(|s| s.created_at)
                .or_else(|| timestamp_field(record, &["createdAt"]))
                .unwrap_or(now),
            updated_at: timestamp_field(record, &["updatedAt"]).unwrap_or(now),
            data,
        })
    }

    pub fn from_stored(row: &Value) -> Option<Self> {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Some(Self {
            id: text(row, "id")?,
            document_id: uuid_field(row, &["document_id"])?,
            owner_user_id: uuid_field(row, &["owner_user_id"]),
            source_id: text(row, "source_id")?,
            target_id: text(row, "target_id")?,
            edge_type: text(row, "edge_type"),
            label: text(row, "label"),
            data: canonical_data(row.get("data")),
            created_at: timestamp_field(row, &["created_at"]).unwrap_or(epoch),
            updated_at: timestamp_field(row, &["updated_at"]).unwrap_or(epoch),
        })
    }

    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.document_id == other.document_id
            && self.owner_user_id == other.owner_user_id
            && self.source_id == other.source_id
            && self.target_id == other.target_id
            && self.edge_type == other.edge_type
            && self.label == other.label
            && self.data == other.data
    }

    pub fn to_record(&self) -> Value {
        let mut record = Map::new();
        record.insert("id".into(), Value::String(self.id.clone()));
        record.insert("source".into(), Value::String(self.source_id.clone()));
        record.insert("target".into(), Value::String(self.target_id.clone()));
        if let Some(edge_type) = &self.edge_type {
            record.insert("type".into(), Value::String(edge_type.clone()));
        }
        if let Some(label) = &self.label {
            record.insert("label".into(), Value::String(label.clone()));
        }
        if let Some(owner) = self.owner_user_id {
            record.insert("ownerUserId".into(), Value::String(owner.to_string()));
        }
        record.insert("data".into(), Value::Object(self.data.clone()));
        record.insert("createdAt".into(), Value::String(self.created_at.to_rfc3339()));
        record.insert("updatedAt".into(), Value::String(self.updated_at.to_rfc3339()));
        Value::Object(record)
    }
}

/// Nodes and edges of one document, each ordered by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeRow>,
    pub edges: Vec<EdgeRow>,
}

impl GraphSnapshot {
    pub fn new(mut nodes: Vec<NodeRow>, mut edges: Vec<EdgeRow>) -> Self {
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Self { nodes, edges }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2024-06-01T10:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_node_position_coercion() {
        let doc = Uuid::new_v4();
        let record = json!({"id": "n1", "type": "task", "position": {"x": "12.5", "y": 40}, "width": "120"});
        let row = NodeRow::from_record("n1", &record, doc, None, now()).unwrap();
        assert_eq!(row.position_x, 12.5);
        assert_eq!(row.position_y, 40.0);
        assert_eq!(row.width, Some(120.0));
        assert_eq!(row.node_type, "task");
        assert_eq!(row.created_at, now());

        let bad = json!({"position": {"x": "left", "y": null}});
        let row = NodeRow::from_record("n2", &bad, doc, None, now()).unwrap();
        assert_eq!((row.position_x, row.position_y), (0.0, 0.0));
        assert_eq!(row.node_type, "default");
    }

    #[test]
    fn test_ephemeral_and_banned_keys_stripped() {
        let record = json!({
            "position": {"x": 0, "y": 0},
            "selected": true,
            "data": {
                "label": "Plan",
                "dragging": true,
                "__proto__": {"polluted": true},
                "nested": {"constructor": 1, "keep": 2, "gone": null}
            }
        });
        let row = NodeRow::from_record("n1", &record, Uuid::new_v4(), None, now()).unwrap();
        assert_eq!(Value::Object(row.data.clone()), json!({"label": "Plan", "nested": {"keep": 2}}));
        assert_eq!(row.label.as_deref(), Some("Plan"));
    }

    #[test]
    fn test_edge_without_endpoints_rejected() {
        let doc = Uuid::new_v4();
        assert!(EdgeRow::from_record("e1", &json!({"source": "a"}), doc, None, now()).is_none());
        assert!(EdgeRow::from_record("e1", &json!({"target": "b", "source": ""}), doc, None, now()).is_none());

        let edge = EdgeRow::from_record("e1", &json!({"source": "a", "target": "b", "sourceHandle": "right"}), doc, None, now())
            .unwrap();
        assert_eq!(edge.data.get("sourceHandle"), Some(&json!("right")));
    }

    #[test]
    fn test_same_content_ignores_timestamps() {
        let doc = Uuid::new_v4();
        let record = json!({"position": {"x": 1, "y": 2}, "data": {"a": 1}});
        let a = NodeRow::from_record("n1", &record, doc, None, now()).unwrap();
        let mut b = a.clone();
        b.updated_at = Utc::now();
        assert!(a.same_content(&b));
        b.data.insert("a".into(), json!(2));
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_stored_row_survives_seed_and_normalize() {
        let doc = Uuid::new_v4();
        let stored = json!({
            "id": "n1",
            "document_id": doc.to_string(),
            "owner_user_id": Uuid::new_v4().to_string(),
            "node_type": "note",
            "position_x": 100,
            "position_y": -20.25,
            "width": null,
            "height": 80,
            "label": "Idea",
            "data": {"color": "red", "tags": ["a", "b"]},
            "created_at": "2024-01-01T00:00:00+00:00",
            "updated_at": "2024-01-02T00:00:00+00:00",
        });
        let row = NodeRow::from_stored(&stored).unwrap();
        let again = NodeRow::from_record(&row.id, &row.to_record(), doc, Some(&row), now()).unwrap();
        assert_eq!(again, row);

        let edge = json!({
            "id": "e1",
            "document_id": doc.to_string(),
            "source_id": "n1",
            "target_id": "n2",
            "data": {"sourceHandle": "bottom"},
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        });
        let edge = EdgeRow::from_stored(&edge).unwrap();
        let again = EdgeRow::from_record(&edge.id, &edge.to_record(), doc, Some(&edge), now()).unwrap();
        assert_eq!(again, edge);
    }

    #[test]
    fn test_snapshot_orders_by_id() {
        let doc = Uuid::new_v4();
        let make = |id: &str| NodeRow::from_record(id, &json!({}), doc, None, now()).unwrap();
        let snapshot = GraphSnapshot::new(vec![make("b"), make("a"), make("c")], vec![]);
        let ids: Vec<&str> = snapshot.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_timestamp_coercion() {
        assert_eq!(coerce_timestamp(&json!(0)), Some(DateTime::<Utc>::UNIX_EPOCH));
        assert!(coerce_timestamp(&json!("yesterday")).is_none());
        assert_eq!(coerce_number(&json!("NaN")), None);
    }
}
