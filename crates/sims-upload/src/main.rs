//! SIMS upload - worker and operator CLI

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sims_common::logging::{init_logging, LogConfig, LogLevel};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use sims_upload::{
    config::Config,
    db,
    ingest::{planner, CalamineReader, ConflictResolution, PipelineOrchestrator},
    jobs::{JobStore, PgJobStore},
    runner::{AdmissionLimits, EnqueueRequest, JobRunner, PgJobQueue, UploadStorage, Worker},
    sheets::{PgSheetConfigResolver, SheetConfigResolver, StaticSheetConfigResolver},
    warehouse::PgWarehouse,
};

#[derive(Parser, Debug)]
#[command(name = "sims-upload")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Process queued uploads until interrupted
    Worker {
        /// Overrides UPLOAD_WORKER_CONCURRENCY
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Exit once the queue is empty
        #[arg(long)]
        until_idle: bool,
    },

    /// Admit a workbook and queue it
    Enqueue(UploadArgs),

    /// Admit a workbook and run the pipeline in this process
    Run(UploadArgs),

    /// Show a job, its result and recent events
    Status {
        job_id: Uuid,

        /// Number of latest events to include
        #[arg(long, default_value_t = 20)]
        events: usize,
    },

    /// List recent jobs, newest first
    Jobs {
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Suggest column names and types for every sheet of a workbook
    Plan { workbook: PathBuf },
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// Workbook file (.xlsx, .xlsm, .xls, .ods)
    workbook: PathBuf,

    /// Workbook type, e.g. "enrolment"
    #[arg(short = 't', long = "type")]
    workbook_type: String,

    /// Sheet to ingest
    #[arg(short, long)]
    sheet: String,

    #[arg(long)]
    workbook_name: Option<String>,

    #[arg(long)]
    source_year: Option<i32>,

    #[arg(long)]
    batch_id: Option<String>,

    /// append, replace or skip
    #[arg(long)]
    conflict_resolution: Option<ConflictResolution>,

    /// Overrides UPLOAD_MAX_FILE_SIZE_BYTES for this upload
    #[arg(long)]
    max_file_size: Option<u64>,

    /// Overrides UPLOAD_MAX_ROWS for this upload
    #[arg(long)]
    max_rows: Option<u64>,
}

impl UploadArgs {
    fn to_request(&self) -> EnqueueRequest {
        let limits = (self.max_file_size.is_some() || self.max_rows.is_some()).then_some(
            AdmissionLimits {
                max_file_size_bytes: self.max_file_size,
                max_rows: self.max_rows,
            },
        );

        EnqueueRequest {
            workbook_path: self.workbook.clone(),
            original_filename: None,
            workbook_type: self.workbook_type.clone(),
            sheet_name: self.sheet.clone(),
            workbook_name: self.workbook_name.clone(),
            source_year: self.source_year,
            batch_id: self.batch_id.clone(),
            conflict_resolution: self.conflict_resolution,
            file_size: None,
            row_count: None,
            limits,
        }
    }
}

#[derive(Serialize)]
struct StatusOutput<T: Serialize, E: Serialize> {
    #[serde(flatten)]
    detail: T,
    events: E,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // LOG_* variables win over these defaults
    let mut log_config = LogConfig::from_env()?;
    if log_config.filter_directives.is_none() {
        log_config.filter_directives = Some(if cli.verbose {
            "sims_upload=debug,sqlx=warn".to_string()
        } else {
            "sqlx=warn".to_string()
        });
    }
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _guard = init_logging(&log_config)?;

    let config = Config::load()?;
    execute(cli.command, &config).await
}

async fn connect(config: &Config) -> Result<Arc<PgPool>> {
    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    Ok(Arc::new(pool))
}

async fn execute(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Migrate => {
            let pool = connect(config).await?;
            db::run_migrations(&pool).await.context("Failed to run migrations")?;
            Ok(())
        },

        Commands::Worker {
            concurrency,
            until_idle,
        } => {
            let pool = connect(config).await?;
            let mut worker_config = config.worker_config();
            if let Some(concurrency) = concurrency {
                worker_config.concurrency = concurrency.max(1);
            }

            let queue = Arc::new(PgJobQueue::new(Arc::clone(&pool), config.queue.name.clone()));
            let worker = Worker::new(queue, orchestrator(config, &pool)?, worker_config);
            info!(worker_id = worker.worker_id(), "Starting upload worker");

            let stats = if until_idle {
                worker.run_until_idle().await?
            } else {
                let shutdown = CancellationToken::new();
                let trigger = shutdown.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    trigger.cancel();
                });
                worker.run(shutdown).await?
            };
            print_json(&stats)
        },

        Commands::Enqueue(args) => {
            let pool = connect(config).await?;
            let runner = job_runner(config, &pool)?
                .with_storage(UploadStorage::new(config.upload.upload_dir.clone()));
            let (job, handle) = runner.enqueue(&args.to_request()).await?;
            print_json(&serde_json::json!({ "job": job, "queue": handle }))
        },

        Commands::Run(args) => {
            let pool = connect(config).await?;
            let runner = job_runner(config, &pool)?;
            let report = runner.run_now(&args.to_request()).await?;
            print_json(&report)?;
            report.into_result()?;
            Ok(())
        },

        Commands::Status { job_id, events } => {
            let jobs = PgJobStore::new(connect(config).await?);
            let detail = jobs.job_detail(job_id).await?;
            let events = jobs.list_events(job_id, Some(events)).await?;
            print_json(&StatusOutput { detail, events })
        },

        Commands::Jobs { limit } => {
            let jobs = PgJobStore::new(connect(config).await?);
            print_json(&jobs.list_recent_jobs(limit).await?)
        },

        Commands::Plan { workbook } => {
            let plans = tokio::task::spawn_blocking(move || {
                planner::plan_workbook(&CalamineReader, &workbook)
            })
            .await
            .context("Plan task failed")??;
            print_json(&plans)
        },
    }
}

fn sheet_resolver(config: &Config, pool: &Arc<PgPool>) -> Result<Arc<dyn SheetConfigResolver>> {
    Ok(match &config.upload.sheet_config_file {
        Some(path) => Arc::new(
            StaticSheetConfigResolver::from_json_file(path)
                .with_context(|| format!("Failed to read sheet configs from {}", path.display()))?,
        ),
        None => Arc::new(PgSheetConfigResolver::new(Arc::clone(pool))),
    })
}

fn orchestrator(config: &Config, pool: &Arc<PgPool>) -> Result<Arc<PipelineOrchestrator>> {
    Ok(Arc::new(PipelineOrchestrator::new(
        Arc::new(PgJobStore::new(Arc::clone(pool))),
        Arc::new(PgWarehouse::new(Arc::clone(pool))),
        sheet_resolver(config, pool)?,
        config.pipeline_settings(),
    )))
}

fn job_runner(config: &Config, pool: &Arc<PgPool>) -> Result<JobRunner> {
    Ok(JobRunner::new(
        Arc::new(PgJobStore::new(Arc::clone(pool))),
        Arc::new(PgJobQueue::new(Arc::clone(pool), config.queue.name.clone())),
        orchestrator(config, pool)?,
        Arc::new(CalamineReader),
        config.admission_limits(),
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing in-flight jobs");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing in-flight jobs");
        },
    }
}
