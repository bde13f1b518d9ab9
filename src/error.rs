use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AskError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Statement rejected: {0}")]
    Policy(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for AskError {
    fn from(err: polars::error::PolarsError) -> Self {
        AskError::Polars(err.to_string())
    }
}

impl AskError {
    /// Where the error belongs in the run taxonomy, if anywhere.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AskError::Extraction(_) => Some(ErrorKind::ExtractionFailed),
            AskError::Execution(_) | AskError::Polars(_) => Some(ErrorKind::ExecutionFailed),
            AskError::Policy(_) => Some(ErrorKind::PolicyRejected),
            _ => None,
        }
    }
}

/// Ways a run can terminate short of a final explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The model declared the question unanswerable. Benign.
    InvalidQuestion,
    /// The model reply held neither a fenced query nor the invalid marker.
    ExtractionFailed,
    /// The warehouse rejected or could not complete the statement.
    ExecutionFailed,
    /// The model stream ended without a `stop` finish reason.
    StreamIncomplete,
    /// The statement policy refused the query before execution.
    PolicyRejected,
    /// Execution produced nothing to analyse.
    NoQuery,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidQuestion => "InvalidQuestion",
            ErrorKind::ExtractionFailed => "ExtractionFailed",
            ErrorKind::ExecutionFailed => "ExecutionFailed",
            ErrorKind::StreamIncomplete => "StreamIncomplete",
            ErrorKind::PolicyRejected => "PolicyRejected",
            ErrorKind::NoQuery => "NoQuery",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, AskError>;
