mod file_config;

pub use file_config::{ExecutorConfig, FileConfig, JobsConfig, PoolsConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_path: Option<PathBuf>,
    pub max_tries: Option<u32>,
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub jobs: JobsSettings,
    pub executor: ExecutorSettings,
    pub pools: PoolSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_path = file
            .db_path
            .map(PathBuf::from)
            .or_else(|| cli.db_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_path must be specified via --db or in config file")
            })?;

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                bail!("Database directory does not exist: {:?}", parent);
            }
        }

        let defaults = JobsSettings::default();
        let jobs_file = file.jobs.unwrap_or_default();
        let jobs = JobsSettings {
            max_tries: jobs_file
                .max_tries
                .or(cli.max_tries)
                .unwrap_or(defaults.max_tries),
            worker_threads: jobs_file
                .worker_threads
                .or(cli.worker_threads)
                .unwrap_or(defaults.worker_threads),
            poll_interval_ms: jobs_file
                .poll_interval_ms
                .unwrap_or(defaults.poll_interval_ms),
            stale_processing_threshold_secs: jobs_file
                .stale_processing_threshold_secs
                .unwrap_or(defaults.stale_processing_threshold_secs),
            initial_backoff_secs: jobs_file
                .initial_backoff_secs
                .unwrap_or(defaults.initial_backoff_secs),
            max_backoff_secs: jobs_file
                .max_backoff_secs
                .unwrap_or(defaults.max_backoff_secs),
            backoff_multiplier: jobs_file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
        };

        if jobs.max_tries == 0 {
            bail!("jobs.max_tries must be at least 1");
        }
        if jobs.worker_threads == 0 {
            bail!("jobs.worker_threads must be at least 1");
        }
        if jobs.backoff_multiplier < 1.0 {
            bail!(
                "jobs.backoff_multiplier must be at least 1.0, got {}",
                jobs.backoff_multiplier
            );
        }

        let executor = ExecutorSettings {
            threads: file
                .executor
                .and_then(|e| e.threads)
                .unwrap_or_else(|| ExecutorSettings::default().threads)
                .max(1),
        };

        let pools = PoolSettings {
            default_capacity: file
                .pools
                .and_then(|p| p.default_capacity)
                .unwrap_or_else(|| PoolSettings::default().default_capacity)
                .max(1),
        };

        Ok(Self {
            db_path,
            jobs,
            executor,
            pools,
        })
    }
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub max_tries: u32,
    /// Jobs that may execute at the same time, across all action types.
    pub worker_threads: usize,
    pub poll_interval_ms: u64,
    pub stale_processing_threshold_secs: u64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl JobsSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_processing_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_processing_threshold_secs)
    }
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self {
            max_tries: 3,
            worker_threads: 2,
            poll_interval_ms: 1000,
            stale_processing_threshold_secs: 3600,
            initial_backoff_secs: 30,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

/// Shared executor for in-process work that is not a persisted job.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub threads: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { threads: 4 }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub default_capacity: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { default_capacity: 4 }
    }
}
