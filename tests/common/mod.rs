//! Common test infrastructure
//!
//! Builds job runtimes on temporary databases and provides scriptable
//! actions whose calls can be inspected afterwards.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use docket::config::{ExecutorSettings, JobsSettings, PoolSettings};
use docket::executor::TaskContext;
use docket::jobs::{
    ActionError, Job, JobAction, JobParameters, JobRuntime, JobStatusListener, SqliteJobStore,
};
use tempfile::TempDir;

pub const TEST_ACTION: &str = "index";

/// Settings tuned for fast tests: short polling and immediate retries.
pub fn fast_settings() -> JobsSettings {
    JobsSettings {
        max_tries: 3,
        worker_threads: 2,
        poll_interval_ms: 20,
        stale_processing_threshold_secs: 60,
        initial_backoff_secs: 0,
        max_backoff_secs: 0,
        backoff_multiplier: 1.0,
    }
}

pub struct TestRuntime {
    pub runtime: JobRuntime,
    pub db_path: PathBuf,
    // Keeps the database alive for the test
    _dir: TempDir,
}

impl TestRuntime {
    pub fn new(settings: JobsSettings) -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("jobs.db");
        let runtime = open_runtime(&db_path, settings);
        Self {
            runtime,
            db_path,
            _dir: dir,
        }
    }

    /// Close the runtime and open a fresh one on the same database.
    pub fn reopen(self, settings: JobsSettings) -> Self {
        let Self {
            runtime,
            db_path,
            _dir,
        } = self;
        runtime.close();
        drop(runtime);
        Self {
            runtime: open_runtime(&db_path, settings),
            db_path,
            _dir,
        }
    }
}

fn open_runtime(db_path: &PathBuf, settings: JobsSettings) -> JobRuntime {
    let store = SqliteJobStore::new(db_path).unwrap();
    JobRuntime::new(
        Arc::new(store),
        settings,
        ExecutorSettings { threads: 2 },
        PoolSettings::default(),
    )
    .unwrap()
}

pub fn params(pairs: &[(&str, &str)]) -> JobParameters {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Counts what the scripted actions did, across every job.
#[derive(Default)]
pub struct ActionCalls {
    pub created: AtomicUsize,
    pub executed: AtomicUsize,
    pub rolled_back: AtomicUsize,
    pub executed_jobs: Mutex<Vec<i64>>,
}

impl ActionCalls {
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.rolled_back.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Fail the first attempt of every job, then succeed.
    FailOnce,
    Deactivated,
}

pub struct ScriptedAction {
    job: Job,
    behavior: Behavior,
    calls: Arc<ActionCalls>,
}

impl JobAction for ScriptedAction {
    fn name(&self) -> String {
        format!("scripted {}", self.job.action)
    }

    fn is_activated(&self) -> bool {
        self.behavior != Behavior::Deactivated
    }

    fn execute(&mut self, _ctx: &TaskContext) -> Result<(), ActionError> {
        self.calls.executed.fetch_add(1, Ordering::SeqCst);
        self.calls
            .executed_jobs
            .lock()
            .unwrap()
            .push(self.job.id.unwrap());
        match self.behavior {
            Behavior::Fail => Err(anyhow::anyhow!("scripted failure").into()),
            Behavior::FailOnce if self.job.tries == 0 => {
                Err(anyhow::anyhow!("first attempt fails").into())
            }
            _ => Ok(()),
        }
    }

    fn rollback(&mut self) -> Result<(), ActionError> {
        self.calls.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for [`ScriptedAction`]s sharing one set of counters.
pub fn scripted(
    behavior: Behavior,
    calls: Arc<ActionCalls>,
) -> impl Fn(&Job) -> Result<Box<dyn JobAction>, ActionError> + Send + Sync + 'static {
    move |job: &Job| {
        calls.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedAction {
            job: job.clone(),
            behavior,
            calls: calls.clone(),
        }) as Box<dyn JobAction>)
    }
}

/// Records every listener callback as `(event, job id)`.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<(&'static str, i64)>>,
}

impl RecordingListener {
    pub fn count(&self, event: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == event)
            .count()
    }
}

impl JobStatusListener for RecordingListener {
    fn on_processing(&self, job: &Job) {
        self.events
            .lock()
            .unwrap()
            .push(("processing", job.id.unwrap()));
    }

    fn on_finished(&self, job: &Job) {
        self.events
            .lock()
            .unwrap()
            .push(("finished", job.id.unwrap()));
    }

    fn on_failed(&self, job: &Job) {
        self.events.lock().unwrap().push(("failed", job.id.unwrap()));
    }
}
