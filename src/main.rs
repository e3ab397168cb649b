use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use mailflow::config::PipelineConfig;
use mailflow::error::PipelineError;
use mailflow::ingest::{self, Ingested};
use mailflow::llm::create_provider;
use mailflow::pipeline::{Orchestrator, RunContext, spawn_pipeline_worker};
use mailflow::steps::default_registry;
use mailflow::store::{Database, LibSqlBackend};

/// Grace period for an in-flight run when the worker is stopped.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Email ingestion and processing pipeline.
#[derive(Parser)]
#[command(name = "mailflow", version, about = "Email ingestion and processing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest one or more .eml files
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run pipeline steps for one message (all steps when none are named)
    Run {
        entity_id: String,
        steps: Vec<String>,
        /// Run only the named steps, without their dependencies
        #[arg(long)]
        skip_deps: bool,
        /// Clear accumulated step status before running
        #[arg(long)]
        reset: bool,
    },

    /// Process new messages in the background until Ctrl+C
    Worker,

    /// Show processing status and execution log for one message
    Status { entity_id: String },

    /// List registered steps
    Steps,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", config.db_path.display())
            })?,
    );

    match cli.command {
        Commands::Ingest { files } => cmd_ingest(db.as_ref(), &files).await,
        Commands::Run {
            entity_id,
            steps,
            skip_deps,
            reset,
        } => cmd_run(&config, db, &entity_id, &steps, skip_deps, reset).await,
        Commands::Worker => cmd_worker(&config, db).await,
        Commands::Status { entity_id } => cmd_status(db.as_ref(), &entity_id).await,
        Commands::Steps => cmd_steps(&config, db),
    }
}

fn build_orchestrator(
    config: &PipelineConfig,
    db: Arc<dyn Database>,
) -> anyhow::Result<Orchestrator> {
    let llm = config.llm.as_ref().map(create_provider).transpose()?;
    let registry = default_registry(Arc::clone(&db), llm)?;
    Ok(Orchestrator::new(
        Arc::new(registry),
        db,
        config.default_step_timeout,
    ))
}

async fn cmd_ingest(db: &dyn Database, files: &[PathBuf]) -> anyhow::Result<()> {
    let mut failures = 0;
    for path in files {
        match ingest::ingest_file(db, path).await {
            Ok(Ingested::New(id)) => println!("{}\tnew\t{id}", path.display()),
            Ok(Ingested::Duplicate(id)) => println!("{}\tduplicate\t{id}", path.display()),
            Err(e) => {
                eprintln!("{}\terror\t{e}", path.display());
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} file(s) failed to ingest", files.len());
    }
    Ok(())
}

async fn cmd_run(
    config: &PipelineConfig,
    db: Arc<dyn Database>,
    entity_id: &str,
    steps: &[String],
    skip_deps: bool,
    reset: bool,
) -> anyhow::Result<()> {
    if reset {
        db.reset_processing_status(entity_id).await?;
    }

    let orchestrator = build_orchestrator(config, db)?;
    let requested = (!steps.is_empty()).then_some(steps);

    match orchestrator
        .execute_steps(entity_id, requested, skip_deps)
        .await
    {
        Ok(ctx) => {
            print_run(&ctx);
            Ok(())
        }
        Err(PipelineError::RunAborted { context, source }) => {
            print_run(&context);
            Err(anyhow::anyhow!("run aborted: {source}"))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_run(ctx: &RunContext) {
    let mut names: Vec<&String> = ctx.results.keys().collect();
    names.sort_by_key(|name| ctx.results[*name].completed_at);

    eprintln!("Run for {} ({} ms)", ctx.entity_id, ctx.elapsed().as_millis());
    for name in names {
        let result = &ctx.results[name];
        match &result.error {
            None => eprintln!("   ok     {name} ({} ms)", result.duration_ms),
            Some(error) => eprintln!("   failed {name} ({} ms): {error}", result.duration_ms),
        }
    }
}

async fn cmd_worker(config: &PipelineConfig, db: Arc<dyn Database>) -> anyhow::Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config, Arc::clone(&db))?);

    eprintln!("mailflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Steps: {}",
        orchestrator.registry().step_names().join(" → ")
    );
    eprintln!(
        "   Worker: every {}s, batch of {}",
        config.worker_interval.as_secs(),
        config.worker_batch_size
    );
    eprintln!("   Press Ctrl+C to stop.\n");

    let (mut handle, shutdown) = spawn_pipeline_worker(
        db,
        orchestrator,
        config.worker_interval,
        config.worker_batch_size,
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl+C received, shutting down...");
    shutdown.store(true, Ordering::Relaxed);

    if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, &mut handle)
        .await
        .is_err()
    {
        handle.abort();
    }
    Ok(())
}

async fn cmd_status(db: &dyn Database, entity_id: &str) -> anyhow::Result<()> {
    let entity = db
        .load_entity(entity_id)
        .await?
        .with_context(|| format!("no message with id {entity_id}"))?;

    let status = db.get_processing_status(entity_id).await?;
    let logs = db.list_execution_logs(entity_id).await?;

    let report = serde_json::json!({
        "entity": {
            "id": entity.id,
            "external_id": entity.external_id,
            "thread_id": entity.thread_id,
            "subject": entity.subject,
            "received_at": entity.received_at,
        },
        "status": status,
        "logs": logs,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_steps(config: &PipelineConfig, db: Arc<dyn Database>) -> anyhow::Result<()> {
    let llm = config.llm.as_ref().map(create_provider).transpose()?;
    let registry = default_registry(db, llm)?;

    let mut steps = registry.list_steps();
    steps.sort_by_key(|s| s.priority_value());
    for step in steps {
        let timeout = step
            .timeout_value()
            .unwrap_or(config.default_step_timeout);
        println!(
            "{:<24} priority={:<4} retryable={:<5} timeout={}s deps=[{}]",
            step.name(),
            step.priority_value(),
            step.is_retryable(),
            timeout.as_secs(),
            step.dependencies().join(", ")
        );
    }
    Ok(())
}
