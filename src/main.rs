//! # casebridge CLI
//!
//! The `casebridge` binary drives import jobs: it creates a job for a
//! bundle, analyzes (stages) it, lets the operator review the mapping
//! configuration, and runs the dependency-ordered import.
//!
//! ## Usage
//!
//! ```bash
//! casebridge --config ./config/casebridge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `casebridge init` | Create the SQLite database and run schema migrations |
//! | `casebridge job create <bundle>` | Register a new import job for a bundle |
//! | `casebridge analyze <job>` | Stream the bundle into staging and seed the mapping |
//! | `casebridge mapping show <job>` | Print the job's mapping configuration |
//! | `casebridge mapping set <job> <file>` | Overlay operator decisions from a JSON file |
//! | `casebridge import <job>` | Resolve references and import every entity type |
//! | `casebridge run <bundle>` | Create, analyze and import in one go |
//! | `casebridge status <job>` | Show job status, progress and recent activity |
//! | `casebridge datasets <job>` | List the datasets staged for a job |
//! | `casebridge jobs` | List recent jobs |
//! | `casebridge cancel <job>` | Request cancellation of a running job |
//! | `casebridge purge <job>` | Delete a job's staged rows |

use anyhow::{Context, Result};
use casebridge::analyzer::AnalyzeProgress;
use casebridge::config::{self, Config};
use casebridge::progress::{self, ProgressEvent, ProgressMode, ProgressReporter};
use casebridge::{db, jobs, migrate, status, worker};
use casebridge_core::mapping::MappingConfiguration;
use casebridge_core::models::JobStatus;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// casebridge: bulk migration engine for test-management export bundles.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/casebridge.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "casebridge",
    about = "Bulk migration engine for test-management export bundles",
    version,
    long_about = "casebridge streams a test-management export bundle into staging, \
    resolves reference entities from an operator-reviewed mapping configuration, and \
    imports everything else in dependency order with resumable, idempotent chunks."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/casebridge.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal and
    /// `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file with the job, staging and target
    /// tables. Safe to run more than once.
    Init,

    /// Manage import jobs.
    Job {
        #[command(subcommand)]
        action: JobAction,
    },

    /// Stream a job's bundle into staging and seed its mapping configuration.
    Analyze {
        /// Job id.
        job: String,
    },

    /// Inspect or edit a job's mapping configuration.
    Mapping {
        #[command(subcommand)]
        action: MappingAction,
    },

    /// Import a job's staged data into the target model.
    ///
    /// The job must have been analyzed. Re-running a failed or interrupted
    /// import resumes it; rows already imported are mapped, not duplicated.
    Import {
        /// Job id.
        job: String,
    },

    /// Create a job for a bundle, analyze it and import it.
    Run {
        /// Path to the export bundle (JSON).
        bundle: PathBuf,

        /// Mapping configuration JSON applied after analysis.
        #[arg(long)]
        mapping: Option<PathBuf>,
    },

    /// Show a job's status, progress and recent activity.
    Status {
        /// Job id.
        job: String,

        /// Print the full status record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List the datasets staged for a job.
    Datasets {
        /// Job id.
        job: String,

        #[arg(long)]
        json: bool,
    },

    /// List recent import jobs.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Request cancellation; the job stops at the next chunk boundary.
    Cancel {
        /// Job id.
        job: String,
    },

    /// Delete a job's staged rows.
    Purge {
        /// Job id.
        job: String,

        /// Purge even if the job has not finished.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Register a new import job and print its id.
    Create {
        /// Path to the export bundle (JSON).
        bundle: PathBuf,

        /// Initial mapping configuration JSON.
        #[arg(long)]
        mapping: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum MappingAction {
    /// Print the mapping configuration as JSON.
    Show {
        /// Job id.
        job: String,
    },
    /// Overlay decisions from a JSON file onto the current configuration.
    Set {
        /// Job id.
        job: String,
        /// Mapping configuration JSON.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let mode = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);
    let reporter = mode.reporter();

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized at {}", cfg.db.path.display());
        return Ok(());
    }

    let pool = db::connect(&cfg).await?;
    migrate::apply(&pool).await?;

    let result = dispatch(cli.command, &pool, &cfg, reporter).await;
    pool.close().await;
    result
}

async fn dispatch(
    command: Commands,
    pool: &SqlitePool,
    cfg: &Config,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<()> {
    match command {
        Commands::Init => Ok(()),
        Commands::Job {
            action: JobAction::Create { bundle, mapping },
        } => {
            let id = create(pool, &bundle, mapping.as_deref()).await?;
            println!("{}", id);
            Ok(())
        }
        Commands::Analyze { job } => {
            let status = analyze(pool, cfg, &job, reporter.clone()).await?;
            finish(&reporter, &job, status)
        }
        Commands::Mapping {
            action: MappingAction::Show { job },
        } => {
            let mapping = jobs::load_mapping(pool, &job).await?;
            println!("{}", serde_json::to_string_pretty(&mapping)?);
            Ok(())
        }
        Commands::Mapping {
            action: MappingAction::Set { job, file },
        } => {
            let operator = read_mapping(&file)?;
            let merged = jobs::apply_operator_mapping(pool, &job, operator).await?;
            println!("{}", serde_json::to_string_pretty(&merged)?);
            Ok(())
        }
        Commands::Import { job } => {
            let status = import(pool, cfg, &job, reporter.clone()).await?;
            finish(&reporter, &job, status)
        }
        Commands::Run { bundle, mapping } => {
            let job = create(pool, &bundle, None).await?;
            println!("{}", job);
            let status = analyze(pool, cfg, &job, reporter.clone()).await?;
            if status != JobStatus::Ready {
                return finish(&reporter, &job, status);
            }
            if let Some(path) = mapping {
                jobs::apply_operator_mapping(pool, &job, read_mapping(&path)?).await?;
            }
            let status = import(pool, cfg, &job, reporter.clone()).await?;
            finish(&reporter, &job, status)
        }
        Commands::Status { job, json } => status::run_status(pool, &job, json).await,
        Commands::Datasets { job, json } => status::run_datasets(pool, &job, json).await,
        Commands::Jobs { limit } => status::run_list_jobs(pool, limit).await,
        Commands::Cancel { job } => {
            if jobs::request_cancel(pool, &job).await? {
                println!("Cancellation requested for job {}", job);
            } else {
                println!("Job {} already finished; nothing to cancel", job);
            }
            Ok(())
        }
        Commands::Purge { job, force } => {
            let removed = worker::purge_staging(pool, &job, force).await?;
            println!("Purged {} staged rows for job {}", removed, job);
            Ok(())
        }
    }
}

async fn create(pool: &SqlitePool, bundle: &Path, mapping: Option<&Path>) -> Result<String> {
    if !bundle.is_file() {
        anyhow::bail!("Bundle not found: {}", bundle.display());
    }
    let bundle = bundle
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", bundle.display()))?;
    let mapping = mapping.map(read_mapping).transpose()?;
    jobs::create_job(pool, &bundle, mapping.as_ref()).await
}

fn read_mapping(path: &Path) -> Result<MappingConfiguration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mapping file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse mapping file: {}", path.display()))
}

async fn analyze(
    pool: &SqlitePool,
    cfg: &Config,
    job: &str,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<JobStatus> {
    let job_id = job.to_string();
    let mut on_progress = move |p: AnalyzeProgress| {
        reporter.report(ProgressEvent::Analyzing {
            job: job_id.clone(),
            progress: p,
        })
    };
    worker::run_analyze_job(pool, cfg, job, &mut on_progress).await
}

async fn import(
    pool: &SqlitePool,
    cfg: &Config,
    job: &str,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<JobStatus> {
    let watcher = tokio::spawn(progress::watch_import(
        pool.clone(),
        job.to_string(),
        reporter,
        Duration::from_secs(1),
    ));
    let result = worker::run_import_job(pool, cfg, job).await;
    watcher.abort();
    result
}

/// Report the final status; a failed job makes the command exit non-zero.
fn finish(reporter: &Arc<dyn ProgressReporter>, job: &str, status: JobStatus) -> Result<()> {
    reporter.report(ProgressEvent::Finished {
        job: job.to_string(),
        status,
    });
    println!("{}", status);
    if status == JobStatus::Failed {
        anyhow::bail!("Job {} failed; see `casebridge status {}`", job, job);
    }
    Ok(())
}
