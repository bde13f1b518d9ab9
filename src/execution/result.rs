//! Query Result - what a warehouse hands back for one statement

use polars::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Result data, at most `max_rows` rows when a cap was requested
    pub data: DataFrame,

    /// Rows the warehouse reported for the full result, when it reports it
    pub total_rows: Option<u64>,

    /// Whether rows were dropped to honour a row cap
    pub truncated: bool,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,

    /// Backend that executed the query
    pub engine_name: String,

    /// Backend-specific metadata (job id, bytes processed, ...)
    pub engine_metadata: HashMap<String, serde_json::Value>,
}

impl QueryResult {
    pub fn success(data: DataFrame, engine_name: String, execution_time_ms: u64) -> Self {
        Self {
            data,
            total_rows: None,
            truncated: false,
            execution_time_ms,
            engine_name,
            engine_metadata: HashMap::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.data.height()
    }

    /// Keep at most `max_rows` rows.
    pub fn cap_rows(mut self, max_rows: Option<usize>) -> Self {
        if let Some(limit) = max_rows {
            if self.data.height() > limit {
                let full = self.data.height() as u64;
                self.data = self.data.head(Some(limit));
                self.truncated = true;
                self.total_rows = Some(self.total_rows.map_or(full, |t| t.max(full)));
            }
        }
        self
    }
}
