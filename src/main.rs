use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docket::config::{AppConfig, CliConfig, FileConfig};
use docket::jobs::{Job, JobParameters, JobQueues, JobRuntime, JobStatus, SqliteJobStore};

#[derive(Parser, Debug)]
#[command(about = "Inspect and feed the persisted job queues")]
struct CliArgs {
    /// Path to a TOML config file. Its values override command line flags.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite job database.
    #[clap(long)]
    pub db: Option<PathBuf>,

    /// Attempts a job gets before it is given up.
    #[clap(long)]
    pub max_tries: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a NEW job unless an equal one is already pending.
    Enqueue {
        action: String,
        /// Job parameters as key=value pairs.
        #[clap(value_parser = parse_parameter)]
        params: Vec<(String, String)>,
    },
    /// Print one job.
    Show { id: i64 },
    /// List the jobs of an action type.
    List {
        action: String,
        #[clap(long)]
        status: Option<JobStatus>,
        #[clap(long, default_value_t = 100)]
        limit: usize,
        #[clap(long, default_value_t = 0)]
        offset: usize,
    },
    /// Job counts per status for an action type.
    Stats { action: String },
    /// Recover jobs left PROCESSING by a previous run.
    ResetStale,
}

fn parse_parameter(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => bail!("Expected key=value, got {:?}", s),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;
    let cli_config = CliConfig {
        db_path: cli_args.db.clone(),
        max_tries: cli_args.max_tries,
        worker_threads: None,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    match cli_args.command {
        Command::Enqueue { action, params } => {
            let parameters: JobParameters = params.into_iter().collect();
            let mut job = Job::new(action.as_str(), parameters);
            let queued = open_queues(&config)?.queue(&action).offer(&mut job)?;
            print_json(&json!({ "queued": queued, "job": job }))
        }
        Command::Show { id } => {
            let job = open_queues(&config)?
                .store()
                .get(id)?
                .with_context(|| format!("Job {} not found", id))?;
            print_json(&job)
        }
        Command::List {
            action,
            status,
            limit,
            offset,
        } => print_json(&open_queues(&config)?.queue(&action).list(status, limit, offset)?),
        Command::Stats { action } => {
            let counts = open_queues(&config)?.queue(&action).counts()?;
            print_json(&json!({
                "action": action,
                "total": counts.total(),
                "counts": counts,
            }))
        }
        Command::ResetStale => {
            let runtime = JobRuntime::from_config(&config)?;
            let recovered = runtime.reset_stale()?;
            runtime.close();
            print_json(&json!({ "recovered": recovered }))
        }
    }
}

fn open_queues(config: &AppConfig) -> Result<JobQueues> {
    let store = SqliteJobStore::new(&config.db_path)?;
    Ok(JobQueues::new(Arc::new(store)))
}
