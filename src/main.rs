use askdata::config::AppConfig;
use askdata::execution::{QueryExecutor, ResultTable};
use askdata::pipeline::{NoopObserver, Pipeline, PipelineObserver, RunReport, RunState};
use askdata::prompts::compose_generation_prompt;
use askdata::stream::with_progress_marker;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "askdata")]
#[command(about = "Ask your data: question -> SQL -> result -> explanation")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question
    Ask {
        /// The question, in any language
        question: String,

        /// Print the run report as JSON instead of streaming output
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        options: Options,
    },
    /// Ask questions interactively, one per line
    Repl {
        #[command(flatten)]
        options: Options,
    },
    /// Print the SQL-generation prompt for a question without calling anything
    Prompt {
        question: String,

        /// JSON schema description (default: built-in company table)
        #[arg(long)]
        schema: Option<PathBuf>,
    },
}

#[derive(Args)]
struct Options {
    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Model identifier (or set OPENAI_MODEL, default: gpt-4-turbo)
    #[arg(long)]
    model: Option<String>,

    /// JSON schema description (or set ASKDATA_SCHEMA)
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Query a local CSV file instead of BigQuery (or set ASKDATA_LOCAL_CSV)
    #[arg(long)]
    local_csv: Option<PathBuf>,

    /// Maximum rows to render, 0 for no limit (default: 1000)
    #[arg(long)]
    max_rows: Option<usize>,

    /// Only execute query statements
    #[arg(long)]
    read_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("askdata=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ask { question, json, options } => ask(question, json, options).await,
        Commands::Repl { options } => repl(options).await,
        Commands::Prompt { question, schema } => {
            let config = AppConfig::from_env()?.with_schema_path(schema);
            let schema = config.load_schema()?;
            println!("{}", compose_generation_prompt(&question, &schema));
            Ok(())
        }
    }
}

fn build_pipeline(options: Options) -> Result<Pipeline> {
    let config = AppConfig::from_env()?
        .with_api_key(options.api_key)
        .with_model(options.model)
        .with_schema_path(options.schema)
        .with_local_csv(options.local_csv)
        .with_max_rows(options.max_rows)
        .with_read_only(options.read_only);

    let schema = config.load_schema()?;
    let model = config.build_model()?;
    let warehouse = config.build_warehouse(&schema)?;
    info!(
        "Using model {} against {} ({}), table {}",
        config.llm.model,
        warehouse.name(),
        match config.max_rows {
            Some(max) => format!("max {} rows", max),
            None => "no row limit".to_string(),
        },
        schema.qualified_name()
    );

    let executor = QueryExecutor::new(warehouse)
        .with_policy(config.statement_policy)
        .with_max_rows(config.max_rows);

    Ok(Pipeline::new(Arc::new(model), executor, Arc::new(schema)).with_config(config.pipeline))
}

/// Routes Ctrl-C to the run in progress, or ends the process between runs.
#[derive(Clone, Default)]
struct Interrupts {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl Interrupts {
    /// Install the one process-wide Ctrl-C listener.
    fn install() -> Self {
        let interrupts = Self::default();
        let handler = interrupts.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !handler.interrupt() {
                    println!();
                    std::process::exit(130);
                }
            }
        });
        interrupts
    }

    fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.slot() = Some(token.clone());
        token
    }

    fn end_run(&self) {
        *self.slot() = None;
    }

    /// Cancel the active run. Returns false when no run is active.
    fn interrupt(&self) -> bool {
        match self.slot().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn ask(question: String, json: bool, options: Options) -> Result<()> {
    let interrupts = Interrupts::install();
    let pipeline = build_pipeline(options)?;
    let token = interrupts.begin_run();

    let result = if json {
        pipeline.run(&question, &NoopObserver, &token).await
    } else {
        pipeline.run(&question, &TerminalObserver::stdout(), &token).await
    };
    interrupts.end_run();

    let report = result.map_err(|e| anyhow::anyhow!("Run failed: {}", e))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&report);
    }
    Ok(())
}

async fn repl(options: Options) -> Result<()> {
    let interrupts = Interrupts::install();
    let pipeline = build_pipeline(options)?;
    let observer = TerminalObserver::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("Din fråga? ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let question = line.trim();
        if question == "exit" || question == "quit" {
            break;
        }

        let token = interrupts.begin_run();
        let result = pipeline.run(question, &observer, &token).await;
        interrupts.end_run();

        match result {
            Ok(report) => print_summary(&report),
            Err(e) => error!("Run failed: {}", e),
        }
    }

    Ok(())
}

fn print_summary(report: &RunReport) {
    if report.state() == RunState::Aborted {
        if let Some(abort) = &report.abort {
            info!("Run ended early: {}", abort.kind);
        }
    }
    for warning in &report.warnings {
        info!("Warning: {}", warning);
    }
}

/// Erases the progress marker left by the previous fragment.
const ERASE_MARKER: &str = "\u{8} \u{8}";

/// Streams the three run outputs to stdout as they arrive.
///
/// On a terminal the partial text carries the progress marker, redrawn after
/// each fragment and erased when the stream ends.
struct TerminalObserver {
    redraw: bool,
    marker_shown: AtomicBool,
}

impl TerminalObserver {
    fn stdout() -> Self {
        Self {
            redraw: std::io::stdout().is_terminal(),
            marker_shown: AtomicBool::new(false),
        }
    }

    fn print_fragment(&self, fragment: &str) {
        let shown = self.redraw && self.marker_shown.swap(true, Ordering::SeqCst);
        let rendered = render_fragment(fragment, self.redraw, shown);
        let mut out = std::io::stdout().lock();
        write!(out, "{}", rendered).ok();
        out.flush().ok();
    }

    fn finish_stream(&self) {
        if self.marker_shown.swap(false, Ordering::SeqCst) {
            print!("{}", ERASE_MARKER);
        }
        println!("\n");
    }
}

/// Text to write for one fragment.
fn render_fragment(fragment: &str, redraw: bool, marker_shown: bool) -> String {
    if !redraw {
        return fragment.to_string();
    }
    let erase = if marker_shown { ERASE_MARKER } else { "" };
    format!("{}{}", erase, with_progress_marker(fragment))
}

impl PipelineObserver for TerminalObserver {
    fn on_sql_delta(&self, fragment: &str, _text: &str) {
        self.print_fragment(fragment);
    }

    fn on_sql_complete(&self, _text: &str) {
        self.finish_stream();
    }

    fn on_table(&self, table: &ResultTable) {
        println!("{}\n", table);
    }

    fn on_notice(&self, notice: &str) {
        println!("{}\n", notice);
    }

    fn on_explanation_delta(&self, fragment: &str, _text: &str) {
        self.print_fragment(fragment);
    }

    fn on_explanation_complete(&self, _text: &str) {
        self.finish_stream();
    }

    fn on_warning(&self, warning: &str) {
        eprintln!("⚠️  {}", warning);
    }
}
