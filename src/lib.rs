//! Ask questions about a warehouse table in plain language.
//!
//! A run composes a generation prompt from the question and the fixed schema,
//! streams SQL out of a chat model, extracts and executes it, then streams an
//! explanation of the result table out of a second model call.

pub mod config;
pub mod error;
pub mod execution;
pub mod extract;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod schema;
pub mod stream;

pub use error::{AskError, ErrorKind, Result};
pub use pipeline::{NoopObserver, Pipeline, PipelineConfig, PipelineObserver, RunReport, RunState};
pub use schema::SchemaDescription;
