//! HTTP client for the REST-like relational store.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{DbError, DbResult, Filter, FilterOp, RelationalStore, SelectQuery};

/// Relational store reached over HTTP with a service credential
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    base_url: String,
    service_key: String,
}

impl RestStore {
    pub fn new(
        base_url: impl Into<String>,
        service_key: impl Into<String>,
        timeout: Duration,
    ) -> DbResult<Self> {
        let base_url = base_url.into();
        if base_url.is_empty() {
            return Err(DbError::Config("store base URL is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DbError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.into(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn check(response: Response) -> DbResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DbError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RelationalStore for RestStore {
    async fn select(&self, query: &SelectQuery) -> DbResult<Vec<Value>> {
        debug!("Store select on {} ({} filters)", query.table, query.filters.len());
        let response = self
            .authorized(self.client.get(self.table_url(&query.table)))
            .query(&query.to_params())
            .send()
            .await?;

        let rows = Self::check(response).await?.json::<Vec<Value>>().await?;
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: &[Value]) -> DbResult<Vec<Value>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .header("Prefer", "return=representation")
            .json(rows)
            .send()
            .await?;

        let stored = Self::check(response).await?.json::<Vec<Value>>().await?;
        Ok(stored)
    }

    async fn upsert(&self, table: &str, rows: &[Value], on_conflict: &str) -> DbResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    async fn delete_in(&self, table: &str, column: &str, values: &[String]) -> DbResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let filter = Filter {
            column: column.to_string(),
            op: FilterOp::In(values.to_vec()),
        };
        let response = self
            .authorized(self.client.delete(self.table_url(table)))
            .query(&[(column, filter.to_param())])
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}
