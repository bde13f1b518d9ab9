//! SQL Extractor
//!
//! Isolates the executable statement from an assembled model reply. A reply
//! either carries the invalid-question marker, or the SQL inside a fenced
//! block. Anything else is rejected rather than handed to the warehouse.

use crate::error::{AskError, Result};
use crate::prompts::INVALID_MARKER;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```(.*?)```").unwrap();
}

const LANGUAGE_TAGS: &[&str] = &["sql", "googlesql", "bigquery"];
const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Statement to execute, trimmed.
    Sql(String),
    /// The model declared the question unanswerable; nothing to execute.
    InvalidQuestion,
}

impl Extraction {
    pub fn sql(&self) -> Option<&str> {
        match self {
            Extraction::Sql(sql) => Some(sql),
            Extraction::InvalidQuestion => None,
        }
    }
}

pub fn extract(text: &str) -> Result<Extraction> {
    if text.contains(INVALID_MARKER) {
        return Ok(Extraction::InvalidQuestion);
    }

    let Some(captures) = FENCED_BLOCK.captures(text) else {
        let reason = if text.contains(FENCE) {
            "unterminated fenced block"
        } else {
            "no fenced SQL block in model reply"
        };
        return Err(AskError::Extraction(format!("{}: {}", reason, preview(text))));
    };

    let inner = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    let sql = strip_language_tag(inner).trim();
    if sql.is_empty() {
        return Err(AskError::Extraction("fenced block is empty".to_string()));
    }

    Ok(Extraction::Sql(sql.to_string()))
}

/// Wrap a statement the way the model is asked to reply.
pub fn wrap(sql: &str) -> String {
    format!("```sql\n{}\n```", sql)
}

fn strip_language_tag(inner: &str) -> &str {
    let word_end = inner
        .find(|c: char| c.is_whitespace())
        .unwrap_or(inner.len());
    let word = &inner[..word_end];

    if LANGUAGE_TAGS.iter().any(|tag| tag.eq_ignore_ascii_case(word)) {
        &inner[word_end..]
    } else {
        inner
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 80;
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}
