//! Application configuration, resolved from the environment before a run starts.
//!
//! `.env` files are loaded by the binary (dotenv); this module only reads
//! process variables. CLI flags are applied on top with the `with_*` methods.

use crate::error::{AskError, Result};
use crate::execution::{BigQueryWarehouse, LocalWarehouse, StatementPolicy, Warehouse, DEFAULT_BIGQUERY_URL, DEFAULT_LOCATION};
use crate::llm::{OpenAiClient, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::pipeline::PipelineConfig;
use crate::schema::SchemaDescription;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_MAX_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub enum WarehouseConfig {
    BigQuery {
        project_id: Option<String>,
        location: String,
        access_token: Option<String>,
        base_url: String,
    },
    /// CSV file registered under the schema's table name.
    LocalCsv { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub warehouse: WarehouseConfig,
    /// `None` = unbounded
    pub max_rows: Option<usize>,
    pub statement_policy: StatementPolicy,
    pub pipeline: PipelineConfig,
    pub schema_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source (the process environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let llm = LlmConfig {
            api_key: var("OPENAI_API_KEY"),
            model: var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: var("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        };

        let warehouse = match var("ASKDATA_LOCAL_CSV") {
            Some(path) => WarehouseConfig::LocalCsv { path: PathBuf::from(path) },
            None => WarehouseConfig::BigQuery {
                project_id: var("BIGQUERY_PROJECT_ID"),
                location: var("BIGQUERY_LOCATION").unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
                access_token: var("BIGQUERY_ACCESS_TOKEN"),
                base_url: var("BIGQUERY_BASE_URL").unwrap_or_else(|| DEFAULT_BIGQUERY_URL.to_string()),
            },
        };

        let max_rows = match var("ASKDATA_MAX_ROWS") {
            Some(raw) => parse_max_rows(&raw)?,
            None => Some(DEFAULT_MAX_ROWS),
        };

        let statement_policy = match var("ASKDATA_READ_ONLY") {
            Some(raw) if parse_flag("ASKDATA_READ_ONLY", &raw)? => StatementPolicy::ReadOnly,
            _ => StatementPolicy::Unrestricted,
        };

        let allow_incomplete_generation = match var("ASKDATA_ALLOW_INCOMPLETE_SQL") {
            Some(raw) => parse_flag("ASKDATA_ALLOW_INCOMPLETE_SQL", &raw)?,
            None => false,
        };

        Ok(Self {
            llm,
            warehouse,
            max_rows,
            statement_policy,
            pipeline: PipelineConfig {
                allow_incomplete_generation,
            },
            schema_path: var("ASKDATA_SCHEMA").map(PathBuf::from),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        if api_key.is_some() {
            self.llm.api_key = api_key;
        }
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model {
            self.llm.model = model;
        }
        self
    }

    pub fn with_local_csv(mut self, path: Option<PathBuf>) -> Self {
        if let Some(path) = path {
            self.warehouse = WarehouseConfig::LocalCsv { path };
        }
        self
    }

    pub fn with_schema_path(mut self, path: Option<PathBuf>) -> Self {
        if path.is_some() {
            self.schema_path = path;
        }
        self
    }

    /// `Some(0)` lifts the cap.
    pub fn with_max_rows(mut self, max_rows: Option<usize>) -> Self {
        if let Some(max) = max_rows {
            self.max_rows = (max > 0).then_some(max);
        }
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        if read_only {
            self.statement_policy = StatementPolicy::ReadOnly;
        }
        self
    }

    pub fn load_schema(&self) -> Result<SchemaDescription> {
        match &self.schema_path {
            Some(path) => SchemaDescription::load(path),
            None => Ok(SchemaDescription::default()),
        }
    }

    pub fn build_model(&self) -> Result<OpenAiClient> {
        let api_key = self
            .llm
            .api_key
            .clone()
            .ok_or_else(|| AskError::Config("OPENAI_API_KEY is not set (or pass --api-key)".to_string()))?;
        Ok(OpenAiClient::new(api_key, self.llm.model.clone(), self.llm.base_url.clone()))
    }

    pub fn build_warehouse(&self, schema: &SchemaDescription) -> Result<Arc<dyn Warehouse>> {
        match &self.warehouse {
            WarehouseConfig::LocalCsv { path } => {
                Ok(Arc::new(LocalWarehouse::from_csv(schema.table_name.clone(), path)?))
            }
            WarehouseConfig::BigQuery {
                project_id,
                location,
                access_token,
                base_url,
            } => {
                let project_id = project_id
                    .clone()
                    .ok_or_else(|| AskError::Config("BIGQUERY_PROJECT_ID is not set".to_string()))?;
                let access_token = access_token.clone().ok_or_else(|| {
                    AskError::Config("BIGQUERY_ACCESS_TOKEN is not set (or use --local-csv)".to_string())
                })?;
                let warehouse = BigQueryWarehouse::new(project_id, location.clone(), access_token)?
                    .with_base_url(base_url.clone());
                Ok(Arc::new(warehouse))
            }
        }
    }
}

fn parse_max_rows(raw: &str) -> Result<Option<usize>> {
    let value: usize = raw
        .trim()
        .parse()
        .map_err(|_| AskError::Config(format!("ASKDATA_MAX_ROWS must be a number, got '{}'", raw)))?;
    Ok((value > 0).then_some(value))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AskError::Config(format!("{} must be true or false, got '{}'", name, raw))),
    }
}
