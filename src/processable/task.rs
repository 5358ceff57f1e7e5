//! Observable state of one in-process unit of work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::executor::CancelHandle;

use super::progress::{Capability, ProgressListener};
use super::status::ProcessableStatus;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Called after every status change with the task and its new status.
pub type StatusListener = Arc<dyn Fn(&ProcessableTask, ProcessableStatus) + Send + Sync>;

struct TaskState {
    status: ProcessableStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    listeners: Vec<StatusListener>,
}

/// Status, timestamps, progress and error of a submitted unit of work.
///
/// Only the executor running the work moves it through its states; every
/// public accessor is read-only apart from [`cancel`](Self::cancel).
/// Transitions go strictly forward and exactly one terminal status is
/// reached, exactly once.
pub struct ProcessableTask {
    id: u64,
    name: String,
    created_at: DateTime<Utc>,
    capability: Capability,
    state: Mutex<TaskState>,
    canceller: OnceLock<CancelHandle>,
}

impl ProcessableTask {
    pub(crate) fn new(name: String, capability: Capability) -> Self {
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            created_at: Utc::now(),
            capability,
            state: Mutex::new(TaskState {
                status: ProcessableStatus::Created,
                started_at: None,
                finished_at: None,
                error: None,
                listeners: Vec::new(),
            }),
            canceller: OnceLock::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProcessableStatus {
        self.state.lock().unwrap().status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().finished_at
    }

    /// Terminal error, for FAILED and CANCELED tasks.
    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    /// Progress of the wrapped work; `None` when it does not report any.
    pub fn progress(&self) -> Option<u8> {
        self.capability.progress()
    }

    pub fn progress_text(&self) -> Option<String> {
        self.capability.progress_text()
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Subscribe to progress pushes from the wrapped work. False if it
    /// cannot push updates; poll [`progress`](Self::progress) instead.
    pub fn add_progress_listener(&self, listener: ProgressListener) -> bool {
        self.capability.add_progress_listener(listener)
    }

    pub fn add_status_listener(&self, listener: StatusListener) {
        self.state.lock().unwrap().listeners.push(listener);
    }

    /// Ask the executor to cancel the work. False once the task is terminal
    /// or if it was never handed to an executor.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        match self.canceller.get() {
            Some(handle) => handle.cancel(may_interrupt),
            None => false,
        }
    }

    pub(crate) fn bind(&self, handle: CancelHandle) {
        if self.canceller.set(handle).is_err() {
            warn!("Task {} ({}) was bound twice", self.id, self.name);
        }
    }

    /// CREATED to PROCESSING. False if the task already left CREATED, which
    /// happens when it was cancelled before a worker reached it.
    pub(crate) fn start(&self) -> bool {
        self.transition(|state| {
            if state.status != ProcessableStatus::Created {
                return false;
            }
            state.status = ProcessableStatus::Processing;
            state.started_at = Some(Utc::now());
            true
        })
    }

    /// PROCESSING to a terminal status.
    pub(crate) fn finish(&self, status: ProcessableStatus, error: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        self.transition(|state| {
            if state.status != ProcessableStatus::Processing {
                return false;
            }
            state.status = status;
            state.error = error;
            state.finished_at = Some(Utc::now());
            true
        })
    }

    /// CREATED to CANCELED, for work cancelled before it ever ran.
    pub(crate) fn cancel_unstarted(&self) -> bool {
        self.transition(|state| {
            if state.status != ProcessableStatus::Created {
                return false;
            }
            state.status = ProcessableStatus::Canceled;
            state.error = Some("cancelled before start".to_string());
            state.finished_at = Some(Utc::now());
            true
        })
    }

    fn transition(&self, apply: impl FnOnce(&mut TaskState) -> bool) -> bool {
        let (status, listeners) = {
            let mut state = self.state.lock().unwrap();
            if !apply(&mut state) {
                return false;
            }
            (state.status, state.listeners.clone())
        };
        debug!("Task {} ({}) is now {}", self.id, self.name, status);
        for listener in listeners {
            listener(self, status);
        }
        true
    }
}

impl std::fmt::Debug for ProcessableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessableTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("capability", &self.capability)
            .finish()
    }
}

/// Marks the task FAILED if the work unwinds before reporting an outcome.
pub(crate) struct FinishGuard<'a> {
    task: &'a ProcessableTask,
    done: bool,
}

impl<'a> FinishGuard<'a> {
    pub(crate) fn new(task: &'a ProcessableTask) -> Self {
        Self { task, done: false }
    }

    pub(crate) fn finish(mut self, status: ProcessableStatus, error: Option<String>) {
        self.done = true;
        self.task.finish(status, error);
    }
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let reason = if std::thread::panicking() {
                "task panicked"
            } else {
                "task exited without an outcome"
            };
            warn!("Task {} ({}) failed: {}", self.task.id, self.task.name, reason);
            self.task
                .finish(ProcessableStatus::Failed, Some(reason.to_string()));
        }
    }
}
