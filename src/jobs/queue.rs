//! Persisted job queues, one per action type.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use tracing::info;

use super::listener::JobStatusListener;
use super::models::{Job, JobCounts, JobParameters, JobStatus};
use super::store::JobStore;

/// Wakes the master of a queue when work arrives or the runtime stops.
#[derive(Default)]
pub(crate) struct QueueSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl QueueSignal {
    pub(crate) fn notify(&self) {
        *self.pending.lock().unwrap() = true;
        self.cond.notify_all();
    }

    /// Wait for a notification or until `timeout` passes. Returns true if
    /// notified.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let pending = self.pending.lock().unwrap();
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .unwrap();
        std::mem::replace(&mut *pending, false)
    }
}

/// The persisted queue of jobs of one action type.
///
/// `offer` only records work; claiming and running it is the job of the
/// [`JobMaster`](super::JobMaster) for the same action.
pub struct JobQueue {
    action: String,
    store: Arc<dyn JobStore>,
    signal: QueueSignal,
    listeners: Mutex<Vec<Arc<dyn JobStatusListener>>>,
}

impl JobQueue {
    pub fn new(action: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        Self {
            action: action.into(),
            store,
            signal: QueueSignal::default(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn signal(&self) -> &QueueSignal {
        &self.signal
    }

    /// Persist `job` as NEW.
    ///
    /// Returns `Ok(false)` and leaves the store untouched if a job with the
    /// same action and an equal parameter map is already NEW, PROCESSING or
    /// ERROR. On success `job.id` is set.
    pub fn offer(&self, job: &mut Job) -> Result<bool> {
        if job.action != self.action {
            bail!(
                "Job for action {} offered to the {} queue",
                job.action,
                self.action
            );
        }
        if let Some(id) = job.id {
            bail!("Job {} is already persisted", id);
        }
        if job.status != JobStatus::New {
            bail!("Only NEW jobs can be offered, got {}", job.status);
        }

        if !self.store.insert_if_absent(job)? {
            return Ok(false);
        }
        info!(
            "Queued {} job {} with {:?}",
            self.action,
            job.id.unwrap_or_default(),
            job.parameters
        );
        self.signal.notify();
        Ok(true)
    }

    /// The most recent job of this queue whose parameters include every
    /// entry of `filter`. Never claims or modifies it.
    pub fn get_job(&self, filter: &JobParameters) -> Result<Option<Job>> {
        self.store.find_by_parameters(&self.action, filter)
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>> {
        Ok(self
            .store
            .get(id)?
            .filter(|job| job.action == self.action))
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize, offset: usize) -> Result<Vec<Job>> {
        self.store.list(&self.action, status, limit, offset)
    }

    pub fn count(&self, status: Option<JobStatus>) -> Result<usize> {
        self.store.count(&self.action, status)
    }

    pub fn counts(&self) -> Result<JobCounts> {
        self.store.counts(&self.action)
    }

    pub fn add_listener(&self, listener: Arc<dyn JobStatusListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn JobStatusListener>> {
        self.listeners.lock().unwrap().clone()
    }
}

/// Registry of job queues by action type, sharing one store.
pub struct JobQueues {
    store: Arc<dyn JobStore>,
    queues: Mutex<BTreeMap<String, Arc<JobQueue>>>,
}

impl JobQueues {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            queues: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// The queue for `action`, created on first use.
    pub fn queue(&self, action: &str) -> Arc<JobQueue> {
        self.queues
            .lock()
            .unwrap()
            .entry(action.to_string())
            .or_insert_with(|| Arc::new(JobQueue::new(action, self.store.clone())))
            .clone()
    }

    pub fn get(&self, action: &str) -> Option<Arc<JobQueue>> {
        self.queues.lock().unwrap().get(action).cloned()
    }

    pub fn actions(&self) -> Vec<String> {
        self.queues.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn all(&self) -> Vec<Arc<JobQueue>> {
        self.queues.lock().unwrap().values().cloned().collect()
    }
}
