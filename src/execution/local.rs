//! Local Warehouse - polars SQL over in-memory frames
//!
//! Offline stand-in for the real warehouse: tables are registered as frames
//! (or loaded from CSV) and statements run through the polars SQL context.

use crate::error::{AskError, Result};
use crate::execution::result::QueryResult;
use crate::execution::warehouse::Warehouse;
use async_trait::async_trait;
use polars::prelude::*;
use polars::sql::SQLContext;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

#[derive(Default, Clone)]
pub struct LocalWarehouse {
    tables: HashMap<String, DataFrame>,
}

impl LocalWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, data: DataFrame) -> Self {
        self.tables.insert(name.into(), data);
        self
    }

    /// Register a CSV file (with header row) as `name`.
    pub fn from_csv(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AskError::Config(format!("CSV file not found: {}", path.display())));
        }

        info!("📂 Loading CSV: {}", path.display());
        let df = LazyCsvReader::new(path)
            .with_has_header(true)
            .with_infer_schema_length(Some(1000))
            .finish()
            .map_err(|e| AskError::Execution(format!("Failed to load CSV {}: {}", path.display(), e)))?
            .collect()?;
        info!("✅ Loaded {} rows, {} columns", df.height(), df.width());

        Ok(Self::new().with_table(name, df))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.keys().map(|k| k.as_str()).collect()
    }

    /// Strip warehouse-style quoting and dataset qualifiers off registered table names.
    fn adapt_sql(&self, sql: &str) -> String {
        let mut adapted = strip_identifier_quotes(sql);
        for name in self.tables.keys() {
            // project.dataset.table and dataset.table both collapse to table
            let pattern = format!(r"\b(?:[\w-]+\.)+{}\b", regex::escape(name));
            if let Ok(qualified) = Regex::new(&pattern) {
                adapted = qualified.replace_all(&adapted, name.as_str()).into_owned();
            }
        }
        adapted.trim().trim_end_matches(';').to_string()
    }
}

/// Remove backtick identifier quoting, leaving string literals untouched.
fn strip_identifier_quotes(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut literal: Option<char> = None;
    let mut escaped = false;

    for c in sql.chars() {
        match literal {
            Some(quote) => {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == quote {
                    literal = None;
                }
            }
            None => match c {
                '`' => {}
                '\'' | '"' => {
                    literal = Some(c);
                    out.push(c);
                }
                _ => out.push(c),
            },
        }
    }
    out
}

#[async_trait]
impl Warehouse for LocalWarehouse {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(&self, sql: &str, max_rows: Option<usize>) -> Result<QueryResult> {
        let start_time = std::time::Instant::now();
        let adapted = self.adapt_sql(sql);
        let tables = self.tables.clone();

        let data = tokio::task::spawn_blocking(move || -> Result<DataFrame> {
            let mut ctx = SQLContext::new();
            for (name, df) in tables {
                ctx.register(&name, df.lazy());
            }
            ctx.execute(&adapted)
                .and_then(|lf| lf.collect())
                .map_err(|e| AskError::Execution(format!("Local SQL failed: {}", e)))
        })
        .await
        .map_err(|e| AskError::Execution(format!("Local SQL task failed: {}", e)))??;

        let execution_time = start_time.elapsed().as_millis() as u64;
        let mut result = QueryResult::success(data, "local".to_string(), execution_time);
        result.total_rows = Some(result.row_count() as u64);
        Ok(result.cap_rows(max_rows))
    }
}
