//! Pipeline Orchestrator
//!
//! One run per question:
//!
//! ```text
//! Idle -> Generating -> Extracting -> Executing -> AnalysisComposing -> Analyzing -> Done
//!                            |             |
//!                            +-> Aborted <-+
//! ```
//!
//! Stages are strictly sequential within a run. The model and warehouse
//! handles are shared read-only, so independent runs may proceed concurrently
//! on clones of the same `Pipeline`.

use crate::error::{AskError, ErrorKind, Result};
use crate::execution::{QueryExecutor, ResultTable};
use crate::extract::{extract, Extraction};
use crate::llm::ChatModel;
use crate::prompts::{compose_analysis_prompt, compose_generation_prompt, NO_QUERY_RESULT};
use crate::schema::SchemaDescription;
use crate::stream::{aggregate, AssembledText, StreamObserver};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Idle,
    Generating,
    Extracting,
    Executing,
    AnalysisComposing,
    Analyzing,
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything one run produced, including how far it got.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub question: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Every state entered, starting with `Idle`
    pub transitions: Vec<RunState>,
    /// Raw text of the generation stream
    pub generated_text: Option<String>,
    /// Statement that was handed to the executor
    pub sql: Option<String>,
    pub table: Option<ResultTable>,
    pub explanation: Option<String>,
    pub abort: Option<AbortReason>,
    pub warnings: Vec<String>,
}

impl RunReport {
    fn new(question: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            question: question.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            transitions: vec![RunState::Idle],
            generated_text: None,
            sql: None,
            table: None,
            explanation: None,
            abort: None,
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.transitions.last().copied().unwrap_or(RunState::Idle)
    }

    /// Short text to show in place of a table or explanation, for aborted runs.
    pub fn notice(&self) -> Option<&str> {
        self.abort.as_ref().map(|a| a.message.as_str())
    }
}

/// Display hooks for the three observable outputs of a run.
///
/// All methods default to no-ops so a display only implements what it shows.
pub trait PipelineObserver: Send + Sync {
    fn on_state(&self, _state: RunState) {}

    fn on_sql_delta(&self, _fragment: &str, _text: &str) {}

    fn on_sql_complete(&self, _text: &str) {}

    fn on_table(&self, _table: &ResultTable) {}

    /// Short notice shown in place of a table (invalid question, failures).
    fn on_notice(&self, _notice: &str) {}

    fn on_explanation_delta(&self, _fragment: &str, _text: &str) {}

    fn on_explanation_complete(&self, _text: &str) {}

    fn on_warning(&self, _warning: &str) {}
}

/// Observer for headless runs.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Generation,
    Analysis,
}

/// Routes aggregator events to the pipeline observer hooks of one stage.
struct StageObserver<'a> {
    observer: &'a dyn PipelineObserver,
    stage: Stage,
}

impl StreamObserver for StageObserver<'_> {
    fn on_delta(&mut self, fragment: &str, text: &str) {
        match self.stage {
            Stage::Generation => self.observer.on_sql_delta(fragment, text),
            Stage::Analysis => self.observer.on_explanation_delta(fragment, text),
        }
    }

    fn on_finish(&mut self, assembled: &AssembledText) {
        match self.stage {
            Stage::Generation => self.observer.on_sql_complete(&assembled.text),
            Stage::Analysis => self.observer.on_explanation_complete(&assembled.text),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Execute SQL from a generation stream that never signalled "stop".
    pub allow_incomplete_generation: bool,
}

#[derive(Clone)]
pub struct Pipeline {
    model: Arc<dyn ChatModel>,
    executor: QueryExecutor,
    schema: Arc<SchemaDescription>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(model: Arc<dyn ChatModel>, executor: QueryExecutor, schema: Arc<SchemaDescription>) -> Self {
        Self {
            model,
            executor,
            schema,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema(&self) -> &SchemaDescription {
        &self.schema
    }

    /// Answer one question.
    ///
    /// Terminations in the run taxonomy (invalid question, extraction or
    /// execution failure, incomplete stream) come back as an `Ok` report in
    /// the `Aborted` state. `Err` is reserved for transport failures and
    /// cancellation.
    pub async fn run(
        &self,
        question: &str,
        observer: &dyn PipelineObserver,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let report = RunReport::new(question);
        let span = info_span!("run", run_id = %report.run_id);

        self.run_reported(question, report, observer, cancel)
            .instrument(span)
            .await
    }

    async fn run_reported(
        &self,
        question: &str,
        mut report: RunReport,
        observer: &dyn PipelineObserver,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        if question.trim().is_empty() {
            info!("Empty question, nothing to do");
        } else {
            info!("Question: {}", question);
            self.drive(question, &mut report, observer, cancel).await?;
        }
        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    async fn drive(
        &self,
        question: &str,
        report: &mut RunReport,
        observer: &dyn PipelineObserver,
        cancel: &CancellationToken,
    ) -> Result<()> {
        enter(report, observer, RunState::Generating);
        let prompt = compose_generation_prompt(question, &self.schema);
        let generated = self.stream_stage(&prompt, observer, Stage::Generation, cancel).await?;
        report.generated_text = Some(generated.text.clone());

        enter(report, observer, RunState::Extracting);
        if let Some(reason) = generated.incomplete_reason() {
            if !self.config.allow_incomplete_generation {
                abort(report, observer, ErrorKind::StreamIncomplete, reason);
                return Ok(());
            }
            add_warning(report, observer, reason);
        }

        let sql = match extract(&generated.text) {
            Ok(Extraction::Sql(sql)) => sql,
            Ok(Extraction::InvalidQuestion) => {
                abort(report, observer, ErrorKind::InvalidQuestion, NO_QUERY_RESULT.to_string());
                return Ok(());
            }
            Err(AskError::Extraction(message)) => {
                abort(report, observer, ErrorKind::ExtractionFailed, message);
                return Ok(());
            }
            Err(other) => return Err(other),
        };
        report.sql = Some(sql.clone());

        if cancel.is_cancelled() {
            return Err(AskError::Cancelled);
        }

        enter(report, observer, RunState::Executing);
        let table = match self.executor.run_sql(&sql).await {
            Ok(table) => table,
            Err(AskError::Execution(message)) | Err(AskError::Polars(message)) => {
                abort(report, observer, ErrorKind::ExecutionFailed, message);
                return Ok(());
            }
            Err(AskError::Policy(message)) => {
                abort(report, observer, ErrorKind::PolicyRejected, message);
                return Ok(());
            }
            Err(other) => return Err(other),
        };

        if table.is_empty() {
            abort(
                report,
                observer,
                ErrorKind::NoQuery,
                "statement returned no result set".to_string(),
            );
            return Ok(());
        }
        observer.on_table(&table);

        enter(report, observer, RunState::AnalysisComposing);
        let analysis_prompt = compose_analysis_prompt(question, &sql, &table.to_markdown());
        report.table = Some(table);

        enter(report, observer, RunState::Analyzing);
        let explanation = self
            .stream_stage(&analysis_prompt, observer, Stage::Analysis, cancel)
            .await?;
        if let Some(reason) = explanation.incomplete_reason() {
            add_warning(report, observer, format!("explanation may be cut short: {}", reason));
        }
        report.explanation = Some(explanation.text);

        enter(report, observer, RunState::Done);
        Ok(())
    }

    async fn stream_stage(
        &self,
        prompt: &str,
        observer: &dyn PipelineObserver,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<AssembledText> {
        if cancel.is_cancelled() {
            return Err(AskError::Cancelled);
        }
        let stream = self.model.stream_chat(prompt).await?;
        let mut stage_observer = StageObserver { observer, stage };
        aggregate(stream, &mut stage_observer, cancel).await
    }
}

fn enter(report: &mut RunReport, observer: &dyn PipelineObserver, state: RunState) {
    info!("Run state: {:?}", state);
    report.transitions.push(state);
    observer.on_state(state);
}

fn abort(report: &mut RunReport, observer: &dyn PipelineObserver, kind: ErrorKind, message: String) {
    match kind {
        ErrorKind::InvalidQuestion => info!("Question rejected by the model"),
        _ => warn!("Run aborted ({}): {}", kind, message),
    }
    observer.on_notice(&message);
    report.abort = Some(AbortReason { kind, message });
    enter(report, observer, RunState::Aborted);
}

fn add_warning(report: &mut RunReport, observer: &dyn PipelineObserver, warning: String) {
    warn!("{}", warning);
    observer.on_warning(&warning);
    report.warnings.push(warning);
}
