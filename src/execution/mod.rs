//! Execution Module - runs extracted SQL against a warehouse
//!
//! - `Warehouse` trait for pluggable backends
//! - `BigQueryWarehouse`: REST jobs.query / getQueryResults
//! - `LocalWarehouse`: polars SQL over in-memory frames or CSV files
//! - `QueryExecutor`: statement policy, row cap, single execution, rendering
//! - `ResultTable`: display-ready markdown table

pub mod warehouse;
pub mod result;
pub mod table;
pub mod executor;

// Warehouse implementations
pub mod bigquery;
pub mod local;

pub use bigquery::{BigQueryWarehouse, DEFAULT_BIGQUERY_URL, DEFAULT_LOCATION};
pub use executor::{QueryExecutor, StatementPolicy};
pub use local::LocalWarehouse;
pub use result::QueryResult;
pub use table::ResultTable;
pub use warehouse::Warehouse;
