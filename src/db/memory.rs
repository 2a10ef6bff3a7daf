//! In-process relational store.
//!
//! Used when no store URL is configured and by tests, which inspect the
//! recorded write batches.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{compare_values, scalar_text, DbError, DbResult, RelationalStore, SelectQuery};

/// One recorded write request
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        table: String,
        rows: Vec<Value>,
    },
    Upsert {
        table: String,
        rows: Vec<Value>,
        on_conflict: String,
    },
    Delete {
        table: String,
        column: String,
        values: Vec<String>,
    },
}

impl WriteOp {
    pub fn table(&self) -> &str {
        match self {
            WriteOp::Insert { table, .. } | WriteOp::Upsert { table, .. } | WriteOp::Delete { table, .. } => table,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
    writes: Mutex<Vec<WriteOp>>,
    unavailable: AtomicBool,
    failing_tables: RwLock<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a table's contents without recording a write
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables.write().insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<WriteOp> {
        self.writes.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Make every call fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make calls touching `table` fail while the rest keep working
    pub fn fail_table(&self, table: &str) {
        self.failing_tables.write().insert(table.to_string());
    }

    fn ensure_available(&self, table: &str) -> DbResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Transport("store unreachable".to_string()));
        }
        if self.failing_tables.read().contains(table) {
            return Err(DbError::Transport(format!("{} unreachable", table)));
        }
        Ok(())
    }

    fn record(&self, op: WriteOp) {
        self.writes.lock().push(op);
    }
}

fn project(row: &Value, columns: &str) -> Value {
    if columns.trim() == "*" {
        return row.clone();
    }
    let mut projected = Map::new();
    for column in columns.split(',').map(str::trim) {
        if let Some(value) = row.get(column) {
            projected.insert(column.to_string(), value.clone());
        }
    }
    Value::Object(projected)
}

fn same_key(existing: &Value, incoming: &Value, conflict_columns: &[&str]) -> bool {
    conflict_columns.iter().all(|column| {
        match (existing.get(*column), incoming.get(*column)) {
            (Some(a), Some(b)) => scalar_text(a) == scalar_text(b),
            _ => false,
        }
    })
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn select(&self, query: &SelectQuery) -> DbResult<Vec<Value>> {
        self.ensure_available(&query.table)?;
        let tables = self.tables.read();
        let mut rows: Vec<Value> = tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| query.filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }

        Ok(rows.iter().map(|row| project(row, &query.columns)).collect())
    }

    async fn insert(&self, table: &str, rows: &[Value]) -> DbResult<Vec<Value>> {
        self.ensure_available(table)?;
        let stored: Vec<Value> = rows
            .iter()
            .cloned()
            .map(|mut row| {
                if let Some(obj) = row.as_object_mut() {
                    obj.entry("id")
                        .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
                }
                row
            })
            .collect();

        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .extend(stored.iter().cloned());
        self.record(WriteOp::Insert {
            table: table.to_string(),
            rows: rows.to_vec(),
        });
        Ok(stored)
    }

    async fn upsert(&self, table: &str, rows: &[Value], on_conflict: &str) -> DbResult<()> {
        self.ensure_available(table)?;
        let conflict_columns: Vec<&str> = on_conflict.split(',').map(str::trim).collect();
        {
            let mut tables = self.tables.write();
            let existing = tables.entry(table.to_string()).or_default();
            for incoming in rows {
                match existing
                    .iter_mut()
                    .find(|row| same_key(row, incoming, &conflict_columns))
                {
                    Some(row) => {
                        if let (Some(target), Some(source)) = (row.as_object_mut(), incoming.as_object()) {
                            for (k, v) in source {
                                target.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    None => existing.push(incoming.clone()),
                }
            }
        }
        self.record(WriteOp::Upsert {
            table: table.to_string(),
            rows: rows.to_vec(),
            on_conflict: on_conflict.to_string(),
        });
        Ok(())
    }

    async fn delete_in(&self, table: &str, column: &str, values: &[String]) -> DbResult<()> {
        self.ensure_available(table)?;
        if let Some(rows) = self.tables.write().get_mut(table) {
            rows.retain(|row| {
                row.get(column)
                    .map(|v| !values.contains(&scalar_text(v)))
                    .unwrap_or(true)
            });
        }
        self.record(WriteOp::Delete {
            table: table.to_string(),
            column: column.to_string(),
            values: values.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_select_filters_orders_and_limits() {
        let store = MemoryStore::new();
        store.seed(
            "document_shares",
            vec![
                json!({"user_id": "u1", "role": "viewer", "updated_at": "2024-01-01T00:00:00Z"}),
                json!({"user_id": "u1", "role": "editor", "updated_at": "2024-03-01T00:00:00Z"}),
                json!({"user_id": "u2", "role": "editor", "updated_at": "2024-05-01T00:00:00Z"}),
            ],
        );

        let rows = store
            .select(
                &SelectQuery::new("document_shares")
                    .columns("role")
                    .eq("user_id", "u1")
                    .order("updated_at", true)
                    .limit(1),
            )
            .await
            .unwrap();

        assert_eq!(rows, vec![json!({"role": "editor"})]);
    }

    #[tokio::test]
    async fn test_upsert_merges_on_conflict_columns() {
        let store = MemoryStore::new();
        store.seed("graph_history_current", vec![json!({"document_id": "d1", "event_id": "e1", "actor_id": "a"})]);

        store
            .upsert(
                "graph_history_current",
                &[json!({"document_id": "d1", "event_id": "e2"}), json!({"document_id": "d2", "event_id": "e3"})],
                "document_id",
            )
            .await
            .unwrap();

        let rows = store.rows("graph_history_current");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], json!({"document_id": "d1", "event_id": "e2", "actor_id": "a"}));
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_assigns_missing_ids() {
        let store = MemoryStore::new();
        let stored = store.insert("graph_history_events", &[json!({"action": "x"})]).await.unwrap();
        assert!(stored[0]["id"].is_string());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.select(&SelectQuery::new("documents")).await.unwrap_err();
        assert!(matches!(err, DbError::Transport(_)));
        assert!(store.upsert("documents", &[json!({"id": "d"})], "id").await.is_err());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_failing_table_leaves_others_working() {
        let store = MemoryStore::new();
        store.seed("documents", vec![json!({"id": "d"})]);
        store.fail_table("document_shares");

        assert!(store.select(&SelectQuery::new("document_shares")).await.is_err());
        assert!(store.insert("document_shares", &[json!({"id": "s"})]).await.is_err());
        assert_eq!(store.select(&SelectQuery::new("documents")).await.unwrap().len(), 1);
    }
}
