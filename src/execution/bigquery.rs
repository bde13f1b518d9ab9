//! BigQuery Warehouse
//!
//! Talks to the BigQuery v2 REST API: `jobs.query` submits the statement and
//! waits server-side for up to `timeoutMs`; `jobs.getQueryResults` is polled
//! until the job completes and then paged until the result set (or the row
//! cap) is exhausted. Credentials are resolved outside this crate; the
//! warehouse only carries an OAuth access token.

use crate::error::{AskError, Result};
use crate::execution::result::QueryResult;
use crate::execution::warehouse::Warehouse;
use async_trait::async_trait;
use polars::prelude::*;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BIGQUERY_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const DEFAULT_LOCATION: &str = "EU";

/// Server-side wait per request while the job runs.
const WAIT_TIMEOUT_MS: u64 = 10_000;
const PAGE_SIZE: usize = 10_000;

pub struct BigQueryWarehouse {
    project_id: String,
    location: String,
    access_token: String,
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    total_rows: Option<String>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    job_complete: Option<bool>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
    #[serde(default)]
    total_bytes_processed: Option<String>,
}

impl QueryResponse {
    fn is_complete(&self) -> bool {
        self.job_complete.unwrap_or(true)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    message: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<u16>,
    message: String,
}

impl BigQueryWarehouse {
    /// # Arguments
    /// * `project_id` - project that runs (and is billed for) the query jobs
    /// * `location` - job location, fixed for the process (e.g. "EU")
    /// * `access_token` - OAuth bearer token with a BigQuery scope
    pub fn new(project_id: String, location: String, access_token: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| AskError::Config(format!("Failed to create HTTP client for BigQuery: {}", e)))?;

        Ok(Self {
            project_id,
            location,
            access_token,
            base_url: DEFAULT_BIGQUERY_URL.to_string(),
            client,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    async fn submit_query(&self, sql: &str, page_size: usize) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries", self.base_url, self.project_id);
        let body = serde_json::json!({
            "query": sql,
            "useLegacySql": false,
            "location": self.location,
            "maxResults": page_size,
            "timeoutMs": WAIT_TIMEOUT_MS,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AskError::Execution(format!("Failed to submit BigQuery query: {}", e)))?;

        read_response(response).await
    }

    async fn fetch_results(
        &self,
        job_id: &str,
        location: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries/{}", self.base_url, self.project_id, job_id);

        let mut params = vec![
            ("location", location.to_string()),
            ("maxResults", page_size.to_string()),
            ("timeoutMs", WAIT_TIMEOUT_MS.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&params)
            .send()
            .await
            .map_err(|e| AskError::Execution(format!("Failed to fetch BigQuery results: {}", e)))?;

        read_response(response).await
    }
}

async fn read_response(response: reqwest::Response) -> Result<QueryResponse> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        // Surface the provider's own message when the body has one
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| match e.error.code {
                Some(code) => format!("{} (code {})", e.error.message, code),
                None => e.error.message,
            })
            .unwrap_or(text);
        return Err(AskError::Execution(format!("BigQuery error ({}): {}", status, message)));
    }

    response
        .json()
        .await
        .map_err(|e| AskError::Execution(format!("Failed to parse BigQuery response: {}", e)))
}

/// Messages from a response's `errors` array. Failed jobs come back as an
/// HTTP error status; on a successful response these are warnings.
fn job_warnings(errors: &[ErrorProto]) -> Vec<String> {
    errors
        .iter()
        .map(|e| match &e.reason {
            Some(reason) => format!("{} ({})", e.message, reason),
            None => e.message.clone(),
        })
        .collect()
}

fn cell_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build a frame from BigQuery's row format. Scalars arrive as JSON strings.
fn rows_to_dataframe(fields: &[FieldSchema], rows: &[TableRow]) -> Result<DataFrame> {
    let mut series_vec = Vec::with_capacity(fields.len());

    for (col_idx, field) in fields.iter().enumerate() {
        let values: Vec<Option<String>> = rows
            .iter()
            .map(|row| row.f.get(col_idx).and_then(|cell| cell_text(&cell.v)))
            .collect();

        let repeated = field.mode.as_deref() == Some("REPEATED");
        let series = match field.field_type.as_str() {
            "INTEGER" | "INT64" if !repeated => {
                let nums: Vec<Option<i64>> = values
                    .iter()
                    .map(|v| v.as_deref().and_then(|s| s.parse().ok()))
                    .collect();
                Series::new(&field.name, nums)
            }
            "FLOAT" | "FLOAT64" | "NUMERIC" | "BIGNUMERIC" if !repeated => {
                let nums: Vec<Option<f64>> = values
                    .iter()
                    .map(|v| v.as_deref().and_then(|s| s.parse().ok()))
                    .collect();
                Series::new(&field.name, nums)
            }
            "BOOLEAN" | "BOOL" if !repeated => {
                let bools: Vec<Option<bool>> = values
                    .iter()
                    .map(|v| v.as_deref().map(|s| s.eq_ignore_ascii_case("true")))
                    .collect();
                Series::new(&field.name, bools)
            }
            // STRING, DATE, TIMESTAMP, RECORD and repeated fields render as text
            _ => Series::new(&field.name, values),
        };

        series_vec.push(series);
    }

    DataFrame::new(series_vec)
        .map_err(|e| AskError::Execution(format!("Failed to create DataFrame: {}", e)))
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    async fn execute(&self, sql: &str, max_rows: Option<usize>) -> Result<QueryResult> {
        let start_time = std::time::Instant::now();
        let page_size = max_rows.map_or(PAGE_SIZE, |m| m.clamp(1, PAGE_SIZE));

        let mut response = self.submit_query(sql, page_size).await?;
        let (job_id, location) = match &response.job_reference {
            Some(job) => (
                Some(job.job_id.clone()),
                job.location.clone().unwrap_or_else(|| self.location.clone()),
            ),
            None => (None, self.location.clone()),
        };
        info!("BigQuery job submitted: {}", job_id.as_deref().unwrap_or("<none>"));

        let mut fields: Option<Vec<FieldSchema>> = None;
        let mut rows: Vec<TableRow> = Vec::new();
        let mut total_rows: Option<u64> = None;
        let mut bytes_processed: Option<String> = None;
        let mut warnings: Vec<String> = Vec::new();
        let mut truncated = false;
        let mut polls = 0usize;

        loop {
            let mut page_token = None;

            if response.is_complete() {
                if fields.is_none() {
                    fields = response.schema.take().map(|s| s.fields);
                }
                if total_rows.is_none() {
                    total_rows = response.total_rows.as_deref().and_then(|t| t.parse().ok());
                }
                if bytes_processed.is_none() {
                    bytes_processed = response.total_bytes_processed.take();
                }
                for warning in job_warnings(&response.errors) {
                    if !warnings.contains(&warning) {
                        warn!("⚠️  BigQuery job warning: {}", warning);
                        warnings.push(warning);
                    }
                }
                rows.append(&mut response.rows);
                page_token = response.page_token.take();

                if let Some(limit) = max_rows {
                    if rows.len() >= limit {
                        truncated = rows.len() > limit || page_token.is_some();
                        rows.truncate(limit);
                        break;
                    }
                }
                if page_token.is_none() {
                    break;
                }
            } else {
                polls += 1;
                debug!("BigQuery job still running (poll {})", polls);
            }

            let job_id = job_id
                .as_deref()
                .ok_or_else(|| AskError::Execution("BigQuery response has no job reference".to_string()))?;
            response = self
                .fetch_results(job_id, &location, page_token.as_deref(), page_size)
                .await?;
        }

        let data = match fields {
            Some(fields) if !fields.is_empty() => rows_to_dataframe(&fields, &rows)?,
            // DDL/DML jobs come back without a schema
            _ => DataFrame::default(),
        };

        let execution_time = start_time.elapsed().as_millis() as u64;
        info!(
            "BigQuery returned {} rows in {}ms{}",
            data.height(),
            execution_time,
            if truncated { " (truncated)" } else { "" }
        );

        let mut result = QueryResult::success(data, "bigquery".to_string(), execution_time);
        result.total_rows = total_rows;
        result.truncated = truncated;
        if let Some(job_id) = job_id {
            result
                .engine_metadata
                .insert("job_id".to_string(), serde_json::Value::String(job_id));
        }
        if let Some(bytes) = bytes_processed {
            result
                .engine_metadata
                .insert("total_bytes_processed".to_string(), serde_json::Value::String(bytes));
        }
        if !warnings.is_empty() {
            result
                .engine_metadata
                .insert("warnings".to_string(), serde_json::json!(warnings));
        }

        Ok(result)
    }
}
