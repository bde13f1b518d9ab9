//! Result Table - display-ready rendering of a result set
//!
//! Rendered as a pipe-style markdown table: a header row, an alignment row,
//! one line per result row and no row-index column. Text columns are
//! left-aligned, numeric columns right-aligned.

use crate::error::{AskError, Result};
use crate::execution::result::QueryResult;
use itertools::Itertools;
use polars::prelude::*;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    numeric: Vec<bool>,
    /// Rows in the full result when it was cut to a row cap
    pub total_rows: Option<u64>,
    pub truncated: bool,
}

impl ResultTable {
    /// Marker for "no query was executed".
    pub fn empty() -> Self {
        Self::default()
    }

    /// No columns at all, i.e. nothing to show or analyse.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        let columns_data = df.get_columns();
        let columns: Vec<String> = columns_data.iter().map(|s| s.name().to_string()).collect();
        let numeric: Vec<bool> = columns_data.iter().map(|s| s.dtype().is_numeric()).collect();

        let mut rows = Vec::with_capacity(df.height());
        for row_idx in 0..df.height() {
            let mut row = Vec::with_capacity(columns_data.len());
            for series in columns_data {
                let value = series
                    .get(row_idx)
                    .map_err(|e| AskError::Execution(format!("Failed to get value: {}", e)))?;
                row.push(format_value(&value));
            }
            rows.push(row);
        }

        Ok(Self {
            columns,
            rows,
            numeric,
            total_rows: None,
            truncated: false,
        })
    }

    pub fn from_query_result(result: &QueryResult) -> Result<Self> {
        let mut table = Self::from_frame(&result.data)?;
        table.truncated = result.truncated;
        table.total_rows = result.total_rows;
        Ok(table)
    }

    pub fn to_markdown(&self) -> String {
        if self.is_empty() {
            return String::new();
        }

        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(idx, header)| {
                self.rows
                    .iter()
                    .filter_map(|row| row.get(idx))
                    .map(|cell| display_width(cell))
                    .chain(std::iter::once(display_width(header)))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut lines = Vec::with_capacity(self.rows.len() + 3);
        lines.push(self.render_line(&self.columns, &widths));
        lines.push(format!(
            "|{}|",
            widths
                .iter()
                .zip(&self.numeric)
                .map(|(w, numeric)| {
                    if *numeric {
                        format!("{}:", "-".repeat(w + 1))
                    } else {
                        format!(":{}", "-".repeat(w + 1))
                    }
                })
                .join("|")
        ));
        for row in &self.rows {
            lines.push(self.render_line(row, &widths));
        }

        if self.truncated {
            lines.push(String::new());
            lines.push(match self.total_rows {
                Some(total) => format!("(showing first {} of {} rows)", self.rows.len(), total),
                None => format!("(showing first {} rows; more were available)", self.rows.len()),
            });
        }

        lines.join("\n")
    }

    fn render_line(&self, cells: &[String], widths: &[usize]) -> String {
        let rendered = widths
            .iter()
            .enumerate()
            .map(|(idx, width)| {
                let cell = cells.get(idx).map(String::as_str).unwrap_or("");
                let numeric = self.numeric.get(idx).copied().unwrap_or(false);
                pad(cell, *width, numeric)
            })
            .join(" | ");
        format!("| {} |", rendered)
    }
}

impl std::fmt::Display for ResultTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_markdown())
    }
}

fn display_width(text: &str) -> usize {
    text.chars().count()
}

fn pad(text: &str, width: usize, right_align: bool) -> String {
    let fill = " ".repeat(width.saturating_sub(display_width(text)));
    if right_align {
        format!("{}{}", fill, text)
    } else {
        format!("{}{}", text, fill)
    }
}

fn format_value(value: &AnyValue) -> String {
    match value {
        AnyValue::Null => String::new(),
        AnyValue::String(s) => s.to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        AnyValue::Boolean(b) => b.to_string(),
        AnyValue::Float32(f) => format_float(*f as f64),
        AnyValue::Float64(f) => format_float(*f),
        other => other.to_string(),
    }
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    // Rust's shortest round-trip formatting, without a trailing ".0"
    format!("{}", value)
}
