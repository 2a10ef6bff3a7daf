//! Automerge document wrapper for a collaborative graph.
//!
//! Layout of the document root:
//! - `nodesById`: map of node id to node record
//! - `edgesById`: map of edge id to edge record
//! - `meta`: `stateAuthority`, `lastActorId`, `lastMutationKind`
//!
//! Records are plain JSON-like maps written by clients; the server only
//! reads them back out through [`GraphDocument::export_state`] and writes
//! them when seeding a document from relational rows.

use automerge::{
    transaction::Transactable, AutoCommit, AutoSerde, ObjId, ObjType, ReadDoc, ScalarValue,
    Value as AmValue, ROOT,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::projection::rows::{EdgeRow, NodeRow};

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Marker declaring the document, not the relational rows, as the source of truth
pub const DOCUMENT_PRIMARY: &str = "document_primary";

/// Keys used in the Automerge document structure
pub mod keys {
    pub const NODES: &str = "nodesById";
    pub const EDGES: &str = "edgesById";
    pub const META: &str = "meta";

    pub const STATE_AUTHORITY: &str = "stateAuthority";
    pub const LAST_ACTOR_ID: &str = "lastActorId";
    pub const LAST_MUTATION_KIND: &str = "lastMutationKind";
}

/// Markers carried in the document's `meta` map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub state_authority: Option<String>,
    pub last_actor_id: Option<String>,
    pub last_mutation_kind: Option<String>,
}

impl DocumentMeta {
    pub fn is_document_primary(&self) -> bool {
        self.state_authority.as_deref() == Some(DOCUMENT_PRIMARY)
    }

    fn from_value(value: Option<&Value>) -> Self {
        let field = |key: &str| {
            value
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            state_authority: field(keys::STATE_AUTHORITY),
            last_actor_id: field(keys::LAST_ACTOR_ID),
            last_mutation_kind: field(keys::LAST_MUTATION_KIND),
        }
    }
}

/// Plain-data export of a document, ready for projection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentState {
    pub nodes_by_id: Map<String, Value>,
    pub edges_by_id: Map<String, Value>,
    pub meta: DocumentMeta,
}

/// Collaborative graph document
pub struct GraphDocument {
    doc: AutoCommit,
}

impl GraphDocument {
    /// Create a new document with empty root maps
    pub fn new() -> DocumentResult<Self> {
        let mut doc = AutoCommit::new();
        doc.put_object(ROOT, keys::NODES, ObjType::Map)?;
        doc.put_object(ROOT, keys::EDGES, ObjType::Map)?;
        doc.put_object(ROOT, keys::META, ObjType::Map)?;
        Ok(Self { doc })
    }

    /// Load a document from binary Automerge data
    pub fn load(data: &[u8]) -> DocumentResult<Self> {
        Ok(Self {
            doc: AutoCommit::load(data)?,
        })
    }

    /// Fresh document holding the given rows
    pub fn seed(nodes: &[NodeRow], edges: &[EdgeRow]) -> DocumentResult<Self> {
        let mut document = Self::new()?;
        for node in nodes {
            document.put_node(&node.id, &node.to_record())?;
        }
        for edge in edges {
            document.put_edge(&edge.id, &edge.to_record())?;
        }
        Ok(document)
    }

    /// Save the full document
    pub fn save(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Changes since the last save
    pub fn save_incremental(&mut self) -> Vec<u8> {
        self.doc.save_incremental()
    }

    /// Merge change bytes produced by another replica
    pub fn apply_incremental(&mut self, data: &[u8]) -> DocumentResult<usize> {
        Ok(self.doc.load_incremental(data)?)
    }

    pub fn put_node(&mut self, id: &str, record: &Value) -> DocumentResult<()> {
        let nodes = self.root_map(keys::NODES)?;
        put_value(&mut self.doc, &nodes, id, record)
    }

    pub fn put_edge(&mut self, id: &str, record: &Value) -> DocumentResult<()> {
        let edges = self.root_map(keys::EDGES)?;
        put_value(&mut self.doc, &edges, id, record)
    }

    pub fn remove_node(&mut self, id: &str) -> DocumentResult<()> {
        let nodes = self.root_map(keys::NODES)?;
        self.doc.delete(&nodes, id)?;
        Ok(())
    }

    pub fn remove_edge(&mut self, id: &str) -> DocumentResult<()> {
        let edges = self.root_map(keys::EDGES)?;
        self.doc.delete(&edges, id)?;
        Ok(())
    }

    pub fn set_meta(&mut self, key: &str, value: &str) -> DocumentResult<()> {
        let meta = self.root_map(keys::META)?;
        self.doc.put(&meta, key, value)?;
        Ok(())
    }

    /// Export the whole document as plain JSON
    pub fn export_state(&self) -> DocumentResult<DocumentState> {
        let value = serde_json::to_value(AutoSerde::from(&self.doc))
            .map_err(|e| DocumentError::Serialization(e.to_string()))?;

        let map = |key: &str| value.get(key).and_then(Value::as_object).cloned().unwrap_or_default();
        Ok(DocumentState {
            nodes_by_id: map(keys::NODES),
            edges_by_id: map(keys::EDGES),
            meta: DocumentMeta::from_value(value.get(keys::META)),
        })
    }

    /// Object id of a root map, created if a replica never wrote it
    fn root_map(&mut self, key: &str) -> DocumentResult<ObjId> {
        match self.doc.get(ROOT, key)? {
            Some((AmValue::Object(ObjType::Map), id)) => Ok(id),
            _ => Ok(self.doc.put_object(ROOT, key, ObjType::Map)?),
        }
    }
}

fn scalar(value: &Value) -> ScalarValue {
    match value {
        Value::Bool(b) => ScalarValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => ScalarValue::Int(i),
            (None, Some(u)) => ScalarValue::Uint(u),
            _ => ScalarValue::F64(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => ScalarValue::from(s.as_str()),
        _ => ScalarValue::Null,
    }
}

fn put_value(doc: &mut AutoCommit, obj: &ObjId, key: &str, value: &Value) -> DocumentResult<()> {
    match value {
        Value::Object(map) => {
            let child = doc.put_object(obj, key, ObjType::Map)?;
            for (k, v) in map {
                put_value(doc, &child, k, v)?;
            }
        }
        Value::Array(items) => {
            let child = doc.put_object(obj, key, ObjType::List)?;
            for (index, item) in items.iter().enumerate() {
                insert_value(doc, &child, index, item)?;
            }
        }
        other => doc.put(obj, key, scalar(other))?,
    }
    Ok(())
}

fn insert_value(doc: &mut AutoCommit, list: &ObjId, index: usize, value: &Value) -> DocumentResult<()> {
    match value {
        Value::Object(map) => {
            let child = doc.insert_object(list, index, ObjType::Map)?;
            for (k, v) in map {
                put_value(doc, &child, k, v)?;
            }
        }
        Value::Array(items) => {
            let child = doc.insert_object(list, index, ObjType::List)?;
            for (i, item) in items.iter().enumerate() {
                insert_value(doc, &child, i, item)?;
            }
        }
        other => doc.insert(list, index, scalar(other))?,
    }
    Ok(())
}
