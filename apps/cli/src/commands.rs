//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use relingo_core::{
    DispatchOutcome, LogPublisher, PipelineProgress, RunSummary, SubmitRequest, Worker,
    ingest_content, submit_job,
};
use relingo_shared::{
    AppConfig, CircuitConfig, Destination, FinishedArticle, JobId, PipelineConfig, RetryConfig,
    TransformConfig, init_config, load_config, resolve_db_path,
};
use relingo_storage::Storage;
use relingo_transform::OpenAiClient;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// relingo: rewrite scraped articles into other languages, chunk by chunk.
#[derive(Parser)]
#[command(
    name = "relingo",
    version,
    about = "Clean, translate and improve scraped articles through an LLM pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Submit a job: rewrite one scraped URL into one language.
    Submit {
        /// Source URL (must already be ingested before the job runs).
        #[arg(long)]
        url: String,

        /// Target language, e.g. "Spanish".
        #[arg(short, long)]
        language: String,

        /// Destination blog URL.
        #[arg(long)]
        blog_url: String,

        /// Destination account name.
        #[arg(long)]
        username: String,

        /// Environment variable holding the destination password.
        #[arg(long, default_value = "RELINGO_CMS_PASSWORD")]
        password_env: String,
    },

    /// Store scraped content for a source URL.
    Ingest {
        /// Source URL the content was scraped from.
        #[arg(long)]
        url: String,

        /// File holding the scraped HTML or Markdown.
        #[arg(long)]
        file: PathBuf,
    },

    /// Run the pipeline worker.
    Run {
        /// Exit once no queued job and no pending change event is left.
        #[arg(long)]
        until_idle: bool,

        /// Override `[pipeline] concurrency_limit`.
        #[arg(long)]
        concurrency_limit: Option<u32>,

        /// Override `[pipeline] max_concurrent_invocations`.
        #[arg(long)]
        invocations: Option<u32>,
    },

    /// Show in-flight jobs with per-stage chunk counts.
    Status,

    /// List permanently failed jobs.
    Failures,

    /// List finished articles.
    Articles,

    /// Cancel a job and drop its chunk records.
    Cancel {
        /// Job ID.
        #[arg(long)]
        job: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "relingo=info",
        1 => "relingo=debug",
        _ => "relingo=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Submit {
            url,
            language,
            blog_url,
            username,
            password_env,
        } => cmd_submit(url, language, blog_url, username, &password_env).await,
        Command::Ingest { url, file } => cmd_ingest(&url, &file).await,
        Command::Run {
            until_idle,
            concurrency_limit,
            invocations,
        } => cmd_run(until_idle, concurrency_limit, invocations).await,
        Command::Status => cmd_status().await,
        Command::Failures => cmd_failures().await,
        Command::Articles => cmd_articles().await,
        Command::Cancel { job } => cmd_cancel(&job).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = resolve_db_path(config)?;
    Ok(Storage::open(&path).await?)
}

async fn open_storage_readonly(config: &AppConfig) -> Result<Storage> {
    let path = resolve_db_path(config)?;
    Ok(Storage::open_readonly(&path).await?)
}

// ---------------------------------------------------------------------------
// Intake commands
// ---------------------------------------------------------------------------

async fn cmd_submit(
    url: String,
    language: String,
    blog_url: String,
    username: String,
    password_env: &str,
) -> Result<()> {
    let config = load_config()?;
    let password = std::env::var(password_env)
        .map_err(|_| eyre!("destination password not found. Set the {password_env} environment variable."))?;

    let storage = open_storage(&config).await?;
    let job = submit_job(
        &storage,
        SubmitRequest {
            source_url: url,
            target_language: language,
            destination: Destination {
                blog_url,
                username,
                password,
            },
        },
    )
    .await?;

    if storage.get_raw_content(&job.source_url).await?.is_none() {
        println!(
            "  warning: no scraped content for {} yet; run `relingo ingest` before the job is dispatched",
            job.source_url
        );
    }
    println!("  Job submitted: {}", job.id);
    Ok(())
}

async fn cmd_ingest(url: &str, file: &Path) -> Result<()> {
    let config = load_config()?;
    let content = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;

    let storage = open_storage(&config).await?;
    let stored = ingest_content(&storage, url, &content).await?;
    println!("  Stored {} bytes for {stored}", content.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn cmd_run(
    until_idle: bool,
    concurrency_limit: Option<u32>,
    invocations: Option<u32>,
) -> Result<()> {
    let config = load_config()?;
    let transform_config = TransformConfig::from_app_config(&config)?;

    let mut pipeline = PipelineConfig::from(&config);
    if let Some(limit) = concurrency_limit {
        pipeline.concurrency_limit = limit;
    }
    if let Some(n) = invocations {
        pipeline.max_concurrent_invocations = n.max(1);
    }
    let retry = RetryConfig::from(&config);
    let circuit = CircuitConfig::from(&config);

    let storage = Arc::new(open_storage(&config).await?);
    let transform = Arc::new(OpenAiClient::new(&transform_config)?);
    let worker = Worker::new(
        storage,
        transform,
        Arc::new(LogPublisher),
        pipeline,
        &retry,
        circuit,
    );

    info!(model = %transform_config.model, until_idle, "starting worker");

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current batch");
        }
    };

    let progress = CliProgress::new();
    let summary = worker.run(until_idle, shutdown, &progress).await?;
    progress.spinner.finish_and_clear();

    println!();
    println!("  Worker stopped.");
    println!("  Jobs dispatched: {}", summary.jobs_dispatched);
    println!("  Articles:        {}", summary.articles);
    println!("  Failures:        {}", summary.failures);
    println!("  Steps advanced:  {}", summary.steps_advanced);
    println!("  Retries:         {}", summary.retries_scheduled);
    println!("  Redeliveries:    {}", summary.redeliveries);
    println!();
    Ok(())
}

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl PipelineProgress for CliProgress {
    fn dispatched(&self, outcome: &DispatchOutcome) {
        if let DispatchOutcome::Dispatched { job_id, chunks, .. } = outcome {
            self.spinner
                .println(format!("  started {job_id} ({chunks} chunks)"));
        }
    }

    fn article(&self, article: &FinishedArticle) {
        self.spinner.println(format!(
            "  finished {} [{}] \"{}\"",
            article.source_url, article.target_language, article.metadata.title
        ));
    }

    fn failed(&self, job_id: &JobId) {
        self.spinner.println(format!("  failed {job_id} (see `relingo failures`)"));
    }

    fn tick(&self, totals: &RunSummary) {
        self.spinner.set_message(format!(
            "{} articles, {} failed, {} steps, {} retries",
            totals.articles, totals.failures, totals.steps_advanced, totals.retries_scheduled
        ));
    }
}

// ---------------------------------------------------------------------------
// Operator queries
// ---------------------------------------------------------------------------

async fn cmd_status() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;

    let jobs = storage.in_flight_jobs().await?;
    let queued = storage.count_pending_dispatch().await?;
    let events = storage.count_pending_events().await?;

    println!();
    println!("  In flight: {}   Queued: {queued}   Pending events: {events}", jobs.len());
    if !jobs.is_empty() {
        println!();
        println!(
            "  {:<36}  {:<10}  {:>5}  {:>8}  {:>8}  {:>10}  {:>8}  SOURCE",
            "JOB", "LANGUAGE", "TOTAL", "INITIAL", "CLEANED", "TRANSLATED", "IMPROVED"
        );
    }
    for job in &jobs {
        let [initial, cleaned, translated, improved] = job.stage_counts;
        println!(
            "  {:<36}  {:<10}  {:>5}  {:>8}  {:>8}  {:>10}  {:>8}  {}{}",
            job.job_id.to_string(),
            job.target_language.as_deref().unwrap_or("-"),
            job.total_chunks,
            initial,
            cleaned,
            translated,
            improved,
            job.source_url.as_deref().unwrap_or("<orphaned>"),
            if job.max_retry_count > 0 {
                format!("  (retry {})", job.max_retry_count)
            } else {
                String::new()
            },
        );
    }
    println!();
    Ok(())
}

async fn cmd_failures() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let failures = storage.list_failures().await?;

    if failures.is_empty() {
        println!("No failed jobs.");
        return Ok(());
    }
    for f in &failures {
        let chunk = f
            .chunk_index
            .map(|i| format!(" chunk {i}"))
            .unwrap_or_default();
        println!(
            "  {} [{}] {}{chunk} at {}",
            f.source_url,
            f.target_language,
            f.kind,
            f.updated_at.to_rfc3339()
        );
        println!("      {}", f.reason);
    }
    Ok(())
}

async fn cmd_articles() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage_readonly(&config).await?;
    let articles = storage.list_articles().await?;

    if articles.is_empty() {
        println!("No finished articles.");
        return Ok(());
    }
    for a in &articles {
        println!(
            "  {} [{}] \"{}\" /{} ({} bytes, {})",
            a.source_url,
            a.target_language,
            a.metadata.title,
            a.metadata.slug,
            a.content.len(),
            &a.content_hash[..12.min(a.content_hash.len())]
        );
    }
    Ok(())
}

async fn cmd_cancel(job: &str) -> Result<()> {
    let job_id: JobId = job
        .parse()
        .map_err(|e| eyre!("invalid job ID '{job}': {e}"))?;

    let config = load_config()?;
    let storage = open_storage(&config).await?;
    if storage.cancel_job(&job_id).await? {
        println!("  Cancelled {job_id}");
        Ok(())
    } else {
        Err(eyre!("no job with ID {job_id}"))
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
