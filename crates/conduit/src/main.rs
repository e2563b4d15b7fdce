//! Conduit: interval job scheduler and synchronization engine
//!
//! Main binary with subcommands:
//! - `daemon`: Tick the scheduler until interrupted
//! - `run`: Execute one job now and print its log
//! - `seed`: Load jobs and synchronizations from the configuration file
//! - `jobs` / `logs`: Inspect stored state

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conduit::config::{DEFAULT_DB_PATH, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_TICK_INTERVAL_SECS};
use conduit::{Database, Settings, bootstrap, daemon};
use conduit_scheduler::{DEFAULT_LOG_RETENTION_DAYS, JobLogStore, JobStore, RunRequest};
use conduit_sync::HashStrength;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(about = "Interval job scheduler and synchronization engine", long_about = None)]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, env = "CONDUIT_DB_PATH", default_value = DEFAULT_DB_PATH)]
    db_path: String,

    /// JSON configuration file (jobs, synchronizations, schemas, mappings, api)
    #[arg(long, global = true, env = "CONDUIT_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds between scheduler ticks
    #[arg(long, global = true, env = "CONDUIT_TICK_INTERVAL", default_value_t = DEFAULT_TICK_INTERVAL_SECS)]
    tick_interval: u64,

    /// Maximum jobs running at once
    #[arg(long, global = true, env = "CONDUIT_WORKERS", default_value = "4")]
    workers: usize,

    /// Seconds an action may run before it is abandoned
    #[arg(long, global = true, env = "CONDUIT_ACTION_TIMEOUT", default_value = "300")]
    action_timeout: u64,

    /// Days of job logs kept by the cleanup action
    #[arg(long, global = true, env = "CONDUIT_LOG_RETENTION_DAYS", default_value_t = DEFAULT_LOG_RETENTION_DAYS)]
    log_retention_days: u64,

    /// Content hash used for change detection (sha256, sha512, truncated64)
    #[arg(long, global = true, env = "CONDUIT_HASH_STRENGTH", default_value = "sha256")]
    hash_strength: HashStrength,

    /// Timeout for outbound HTTP requests in seconds
    #[arg(long, global = true, env = "CONDUIT_HTTP_TIMEOUT", default_value_t = DEFAULT_HTTP_TIMEOUT_SECS)]
    http_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            db_path: self.db_path.clone(),
            config_path: self.config.clone(),
            tick_interval: Duration::from_secs(self.tick_interval.max(1)),
            workers: self.workers,
            action_timeout: Duration::from_secs(self.action_timeout),
            log_retention_days: self.log_retention_days,
            hash_strength: self.hash_strength,
            http_timeout: Duration::from_secs(self.http_timeout),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until interrupted
    Daemon,

    /// Run a single job now and print the resulting log as JSON
    Run {
        /// Job id
        #[arg(long)]
        job_id: String,

        /// Ignore the enabled flag and the schedule, and leave the schedule untouched
        #[arg(long)]
        force: bool,
    },

    /// Store the jobs and synchronizations from the configuration file
    Seed,

    /// List stored jobs
    Jobs,

    /// List recent logs for a job, newest first
    Logs {
        /// Job id
        #[arg(long)]
        job_id: String,

        /// Maximum number of logs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "conduit=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();

    match cli.command {
        Commands::Daemon => daemon::run(settings)
            .await
            .map_err(|e| miette::miette!("{}", e)),

        Commands::Run { job_id, force } => run_job(&settings, job_id, force).await,

        Commands::Seed => seed(&settings).await,

        Commands::Jobs => {
            let db = open_db(&settings)?;
            let jobs = db.list_jobs().await.map_err(|e| miette::miette!("{}", e))?;
            print_json(&jobs)
        }

        Commands::Logs { job_id, limit } => {
            let db = open_db(&settings)?;
            let logs = db
                .logs_for_job(&job_id, limit)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&logs)
        }
    }
}

fn open_db(settings: &Settings) -> Result<Database> {
    Database::open(&settings.db_path)
        .map_err(|e| miette::miette!("failed to open database {}: {}", settings.db_path, e))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", out);
    Ok(())
}

async fn run_job(settings: &Settings, job_id: String, force: bool) -> Result<()> {
    let config = settings.load_config().map_err(|e| miette::miette!("{}", e))?;
    let db = Arc::new(open_db(settings)?);
    let engine = bootstrap::build(db, settings, &config).map_err(|e| miette::miette!("{}", e))?;

    let log = engine
        .scheduler
        .run(RunRequest {
            job_id,
            force_run: force,
        })
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    print_json(&log)
}

async fn seed(settings: &Settings) -> Result<()> {
    if settings.config_path.is_none() {
        return Err(miette::miette!(
            "seed needs a configuration file (--config or CONDUIT_CONFIG)"
        ));
    }

    let config = settings.load_config().map_err(|e| miette::miette!("{}", e))?;
    let db = open_db(settings)?;
    let report = bootstrap::seed(&db, &config)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    println!(
        "Seeded {} jobs and {} synchronizations",
        report.jobs, report.synchronizations
    );
    Ok(())
}
