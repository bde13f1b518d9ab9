//! Warehouse Trait - the one call the core makes against the data store

use crate::error::Result;
use crate::execution::result::QueryResult;
use async_trait::async_trait;

/// A SQL endpoint. Handles are shared read-only across concurrent runs.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Backend name (e.g., "bigquery", "local")
    fn name(&self) -> &'static str;

    /// Submit `sql`, wait for completion and fetch the result set.
    ///
    /// With `max_rows` set, the backend may stop fetching once that many rows
    /// are in hand and mark the result truncated.
    async fn execute(&self, sql: &str, max_rows: Option<usize>) -> Result<QueryResult>;
}
