//! CLI command definitions for repo-verifier.
//!
//! `worker` runs the pool and the watchdog until Ctrl-C. The other commands
//! are one-shot operations against the shared Redis broker and PostgreSQL
//! store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::execution::{DockerClient, SandboxExecutor};
use crate::intake::Intake;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::pipeline::{VerificationPipeline, VerifierConfig};
use crate::resolver::llm::LlmInstructionResolver;
use crate::resolver::{InstructionResolver, StaticResolver};
use crate::scheduler::{
    InMemoryJobQueue, JobBroker, JobQueue, QueueStatus, Watchdog, WorkerPool,
};
use crate::storage::{Database, InMemoryJobStore, JobRecord, JobStore, ResultReporter};
use crate::workspace::GitFetcher;

/// Verify that repositories install and start inside an isolated sandbox.
#[derive(Parser)]
#[command(name = "repo-verifier")]
#[command(about = "Clone repositories, infer setup commands and run them in a Docker sandbox")]
#[command(version)]
#[command(
    long_about = "repo-verifier drains a queue of repository URLs. Each job is cloned, its README is turned into setup commands, and the commands run in a resource-limited container without network access.\n\nExample usage:\n  repo-verifier worker --workers 4\n  repo-verifier submit https://github.com/org/app.git"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the worker pool and the stuck-job watchdog until Ctrl-C.
    Worker(WorkerArgs),

    /// Submit up to 10 repository URLs for verification.
    Submit(SubmitArgs),

    /// Show the persisted and queue-level status of a job.
    Status(StatusArgs),

    /// Apply pending database migrations.
    Migrate(BackendArgs),

    /// Print Prometheus metrics, including current queue depth.
    Metrics(BackendArgs),
}

/// Connection settings shared by every command.
#[derive(Parser, Debug, Clone, Default)]
pub struct BackendArgs {
    /// Redis URL of the job broker.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// PostgreSQL URL of the job store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Queue name.
    #[arg(long, env = "VERIFIER_QUEUE_NAME")]
    pub queue_name: Option<String>,
}

/// Arguments for `repo-verifier worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Number of concurrent workers.
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Per-job deadline in seconds.
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    /// Sandbox image.
    #[arg(long)]
    pub image: Option<String>,

    /// Run pending migrations before starting.
    #[arg(long)]
    pub migrate: bool,
}

/// Arguments for `repo-verifier submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Repository URLs to verify.
    #[arg(required = true, num_args = 1..)]
    pub urls: Vec<String>,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `repo-verifier status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Job identifier.
    pub job_id: Uuid,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Migrate(args) => run_migrate_command(args).await,
        Commands::Metrics(args) => run_metrics_command(args).await,
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Loads configuration from the environment and applies CLI overrides.
fn load_config(backend: &BackendArgs) -> anyhow::Result<VerifierConfig> {
    let mut config = VerifierConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = &backend.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(url) = &backend.database_url {
        config = config.with_database_url(url.clone());
    }
    if let Some(name) = &backend.queue_name {
        config = config.with_queue_name(name.clone());
    }
    Ok(config)
}

async fn connect_broker(config: &VerifierConfig) -> anyhow::Result<Arc<dyn JobBroker>> {
    match &config.redis_url {
        Some(url) => {
            let queue = JobQueue::connect(url, &config.pool.queue_name)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Arc::new(queue))
        }
        None => {
            warn!("REDIS_URL not set, using an in-process queue");
            Ok(Arc::new(InMemoryJobQueue::new(&config.pool.queue_name)))
        }
    }
}

async fn connect_database(config: &VerifierConfig) -> anyhow::Result<Database> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for this command")?;
    Database::connect(url)
        .await
        .context("Failed to connect to PostgreSQL")
}

async fn connect_store(config: &VerifierConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    if config.database_url.is_some() {
        Ok(Arc::new(connect_database(config).await?))
    } else {
        warn!("DATABASE_URL not set, using an in-memory job store");
        Ok(Arc::new(InMemoryJobStore::new()))
    }
}

/// Both backends must be shared with the workers for one-shot commands.
fn require_shared_backends(config: &VerifierConfig) -> anyhow::Result<()> {
    if config.redis_url.is_none() || config.database_url.is_none() {
        anyhow::bail!(
            "REDIS_URL and DATABASE_URL are required.\n\
             Set them, or pass --redis-url and --database-url, so the workers can see the submission."
        );
    }
    Ok(())
}

fn build_resolver(config: &VerifierConfig) -> anyhow::Result<Arc<dyn InstructionResolver>> {
    match &config.llm {
        Some(llm) => {
            info!(api_base = %llm.api_base, model = %llm.model, "Using LLM instruction resolver");
            let resolver =
                LlmInstructionResolver::new(&llm.api_base, llm.api_key.clone(), &llm.model)?;
            Ok(Arc::new(resolver))
        }
        None => {
            info!(default_command = ?config.default_command, "Using default setup command");
            Ok(Arc::new(StaticResolver::none()))
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.backend)?;
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(secs) = args.deadline_secs {
        config = config.with_job_deadline(Duration::from_secs(secs));
    }
    if let Some(image) = &args.image {
        config = config.with_image(image.clone());
    }
    config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to register metrics");
    }

    let broker = connect_broker(&config).await?;
    let store = match (&config.database_url, args.migrate) {
        (Some(_), true) => {
            let db = connect_database(&config).await?;
            let applied = db.run_migrations().await?;
            info!(applied, "Database migrations applied");
            Arc::new(db) as Arc<dyn JobStore>
        }
        _ => connect_store(&config).await?,
    };
    let reporter = ResultReporter::new(store);

    let runtime = DockerClient::new().context("Docker is not available")?;
    runtime.ping().await.context("Docker daemon did not answer")?;
    let executor = SandboxExecutor::new(Arc::new(runtime), config.sandbox.clone());

    let pipeline = VerificationPipeline::new(
        Arc::new(GitFetcher::new(config.workspace_root.clone())),
        build_resolver(&config)?,
        executor,
    )
    .with_default_command(config.default_command.clone())
    .with_progress(broker.clone());

    let mut pool = WorkerPool::new(
        config.pool.clone(),
        broker.clone(),
        reporter.clone(),
        Arc::new(pipeline),
        config.retry.clone(),
    );
    pool.start().await?;

    let watchdog = Watchdog::new(reporter, broker, config.watchdog.clone())
        .spawn(pool.shutdown_token());

    info!(
        workers = config.pool.num_workers,
        queue = %config.pool.queue_name,
        "Worker started, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutdown requested, waiting for in-flight jobs");
    let shutdown = pool.shutdown().await;
    if let Err(e) = watchdog.await {
        warn!(error = %e, "Watchdog task ended abnormally");
    }
    shutdown?;

    let stats = pool.stats();
    info!(
        completed = stats.jobs_completed,
        failed = stats.jobs_failed,
        retried = stats.jobs_retried,
        "Worker stopped"
    );
    Ok(())
}

#[derive(Serialize)]
struct SubmitOutput {
    submission_id: Uuid,
    job_ids: Vec<Uuid>,
}

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let config = load_config(&args.backend)?;
    require_shared_backends(&config)?;

    let broker = connect_broker(&config).await?;
    let store = connect_store(&config).await?;
    let intake = Intake::new(broker, store, config.retry.max_attempts);

    let accepted = intake.submit(&args.urls).await?;
    let output = SubmitOutput {
        submission_id: accepted.submission.id,
        job_ids: accepted.handles.iter().map(|h| h.job_id).collect(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✓ Submission {} accepted", output.submission_id);
        for (job_id, url) in output.job_ids.iter().zip(&args.urls) {
            println!("  {}  {}", job_id, url.trim());
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusOutput {
    job: JobRecord,
    queue: Option<QueueStatus>,
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let config = load_config(&args.backend)?;
    let db = connect_database(&config).await?;
    let job = db
        .get_job(args.job_id)
        .await?
        .with_context(|| format!("Job {} not found", args.job_id))?;

    // Queue-level progress is best effort.
    let queue = match &config.redis_url {
        Some(url) => match JobQueue::connect(url, &config.pool.queue_name).await {
            Ok(queue) => queue.status(args.job_id).await.unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read queue status");
                None
            }),
            Err(e) => {
                warn!(error = %e, "Failed to connect to Redis");
                None
            }
        },
        None => None,
    };

    let output = StatusOutput { job, queue };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let job = &output.job;
    println!("Job {}", job.id);
    println!("  Repository:  {}", job.repo_url);
    println!("  Status:      {}", job.status.as_str());
    println!(
        "  Result:      {}",
        match job.result {
            Some(true) => "passed",
            Some(false) => "failed",
            None => "-",
        }
    );
    if let Some(reason) = &job.reason {
        println!("  Reason:      {}", reason);
    }
    println!("  Attempts:    {}/{}", job.attempts, job.max_attempts);
    if let Some(ms) = job.execution_time_ms {
        println!("  Duration:    {:.1}s", ms as f64 / 1000.0);
    }
    if let Some(instructions) = &job.setup_instructions {
        println!("  Setup:       {}", instructions);
    }
    if let Some(queue) = &output.queue {
        println!("  Queue:       {:?} ({}%)", queue.state, queue.progress);
    }
    if !job.logs.is_empty() {
        println!("\n{}", job.logs);
    }
    Ok(())
}

async fn run_migrate_command(args: BackendArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let db = connect_database(&config).await?;
    let applied = db.run_migrations().await?;
    println!("✓ Applied {} migration(s)", applied);
    for migration in db.applied_migrations().await? {
        println!(
            "  {}  {}",
            migration.applied_at.format("%Y-%m-%d %H:%M:%S"),
            migration.name
        );
    }
    Ok(())
}

async fn run_metrics_command(args: BackendArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    init_metrics()?;

    if config.redis_url.is_some() {
        let broker = connect_broker(&config).await?;
        let stats = broker.stats().await?;
        MetricsCollector::new().update_queue_stats(&stats);
    }

    print!("{}", export_metrics());
    Ok(())
}
