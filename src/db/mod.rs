//! Relational store access.
//!
//! The store is reached only through a REST-like interface: column-filtered
//! selects, batch inserts, batch upserts and batch deletes by id set. Two
//! implementations share the [`RelationalStore`] trait:
//! - [`RestStore`] talks HTTP to the configured store
//! - [`MemoryStore`] keeps tables in process and records every write batch

mod memory;
mod rest;

pub use memory::{MemoryStore, WriteOp};
pub use rest::RestStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Default number of rows per write request
pub const DEFAULT_BATCH_SIZE: usize = 200;

/// Errors from the relational store
#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Store response could not be decoded: {0}")]
    Decode(String),

    #[error("Store configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DbError::Decode(err.to_string())
        } else {
            DbError::Transport(err.to_string())
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Comparison applied by a filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(String),
    In(Vec<String>),
}

/// One column filter of a select
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
}

impl Filter {
    /// Query-string value in the store's `eq.` / `in.()` syntax
    pub fn to_param(&self) -> String {
        match &self.op {
            FilterOp::Eq(value) => format!("eq.{}", value),
            FilterOp::In(values) => format!(
                "in.({})",
                values.iter().map(|v| quote_list_item(v)).collect::<Vec<_>>().join(",")
            ),
        }
    }

    /// Evaluate against a JSON row (used by the in-memory store)
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(&self.column).map(scalar_text) else {
            return false;
        };
        match &self.op {
            FilterOp::Eq(expected) => &actual == expected,
            FilterOp::In(values) => values.iter().any(|v| v == &actual),
        }
    }
}

/// Items containing reserved characters must be double-quoted inside `in.()`
fn quote_list_item(value: &str) -> String {
    if value.contains([',', '(', ')', '"', ' ']) {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Text form of a scalar as it appears in filters
pub(crate) fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Timestamp column as UTC, if present and well-formed
pub(crate) fn timestamp_field(row: &Value, column: &str) -> Option<DateTime<Utc>> {
    row.get(column)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Boolean column; anything but an explicit `true` reads as false
pub(crate) fn bool_field(row: &Value, column: &str) -> bool {
    row.get(column).and_then(Value::as_bool).unwrap_or(false)
}

/// Order clause of a select
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// Column-filtered select against one table
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters.push(Filter {
            column: column.into(),
            op: FilterOp::Eq(value.to_string()),
        });
        self
    }

    pub fn in_list<I, V>(mut self, column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.filters.push(Filter {
            column: column.into(),
            op: FilterOp::In(values.into_iter().map(|v| v.to_string()).collect()),
        });
        self
    }

    pub fn order(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query-string pairs for the REST interface
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.columns.clone())];
        for filter in &self.filters {
            params.push((filter.column.clone(), filter.to_param()));
        }
        if let Some(order) = &self.order {
            let direction = if order.descending { "desc" } else { "asc" };
            params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        params
    }
}

/// Ordering used for `order` clauses over JSON values
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => scalar_text(x).cmp(&scalar_text(y)),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// REST-like relational store
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Column-filtered select
    async fn select(&self, query: &SelectQuery) -> DbResult<Vec<Value>>;

    /// Batch insert, returning the stored representation
    async fn insert(&self, table: &str, rows: &[Value]) -> DbResult<Vec<Value>>;

    /// Batch upsert merging duplicates on `on_conflict`
    async fn upsert(&self, table: &str, rows: &[Value], on_conflict: &str) -> DbResult<()>;

    /// Batch delete where `column` is in `values`
    async fn delete_in(&self, table: &str, column: &str, values: &[String]) -> DbResult<()>;
}

/// Upsert in fixed-size chunks. Returns the number of requests issued.
pub async fn upsert_chunked(
    store: &dyn RelationalStore,
    table: &str,
    rows: &[Value],
    on_conflict: &str,
    batch_size: usize,
) -> DbResult<usize> {
    let mut batches = 0;
    for chunk in rows.chunks(batch_size.max(1)) {
        store.upsert(table, chunk, on_conflict).await?;
        batches += 1;
    }
    Ok(batches)
}

/// Delete by id set in fixed-size chunks. Returns the number of requests issued.
pub async fn delete_chunked(
    store: &dyn RelationalStore,
    table: &str,
    column: &str,
    values: &[String],
    batch_size: usize,
) -> DbResult<usize> {
    let mut batches = 0;
    for chunk in values.chunks(batch_size.max(1)) {
        store.delete_in(table, column, chunk).await?;
        batches += 1;
    }
    Ok(batches)
}
