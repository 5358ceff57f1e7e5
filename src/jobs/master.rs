//! Claim loop driving the jobs of one action type.
//!
//! A master waits for a free worker slot, atomically claims the oldest due
//! NEW job of its queue and hands it to the job executor wrapped as a tracked
//! task. It wakes up when a job is offered and otherwise polls, so retries
//! whose backoff has expired are picked up too.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{panic_message, TaskContext};
use crate::pool::{PoolError, ResourcePool};
use crate::processable::{ProcessableExecutor, Unit};

use super::action::{JobAction, JobActionFactory};
use super::models::{now_millis, Job, JobStatus};
use super::queue::JobQueue;
use super::retry_policy::RetryPolicy;

/// Permission to run one job. Masters of all action types share one pool of
/// them, sized to the job worker count.
pub(crate) struct WorkerSlot;

pub(crate) type WorkerSlots = ResourcePool<WorkerSlot>;

pub(crate) fn worker_slots(count: usize) -> WorkerSlots {
    ResourcePool::new(count, || Ok(WorkerSlot))
}

/// Gives its slot back to the pool when the job is done or never ran.
struct HeldSlot {
    slots: Arc<WorkerSlots>,
    slot: Option<WorkerSlot>,
}

impl Drop for HeldSlot {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.slots.release(slot);
        }
    }
}

/// A claimed job on its way to a worker. Dropped before it started, e.g.
/// because its task was cancelled while queued or the executor refused it,
/// it puts the job back to NEW without counting an attempt.
struct Claim {
    queue: Arc<JobQueue>,
    id: i64,
    started: bool,
    // Released after the job is back in the queue
    _slot: HeldSlot,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.started {
            return;
        }
        match self.queue.store().unclaim(self.id) {
            Ok(true) => info!(
                "{} job {} was dropped before it started, back to NEW",
                self.queue.action(),
                self.id
            ),
            Ok(false) => {}
            Err(e) => error!(
                "Failed to put {} job {} back to NEW: {:#}",
                self.queue.action(),
                self.id,
                e
            ),
        }
    }
}

pub struct JobMaster {
    queue: Arc<JobQueue>,
    factory: Arc<dyn JobActionFactory>,
    executor: ProcessableExecutor,
    slots: Arc<WorkerSlots>,
    policy: RetryPolicy,
    poll_interval: Duration,
    token: CancellationToken,
}

impl JobMaster {
    pub(crate) fn new(
        queue: Arc<JobQueue>,
        factory: Arc<dyn JobActionFactory>,
        executor: ProcessableExecutor,
        slots: Arc<WorkerSlots>,
        policy: RetryPolicy,
        poll_interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            queue,
            factory,
            executor,
            slots,
            policy,
            poll_interval,
            token,
        }
    }

    pub fn action(&self) -> &str {
        self.queue.action()
    }

    /// Run until the token is cancelled.
    pub fn run(&self) {
        info!("Job master for {} started", self.action());
        while !self.token.is_cancelled() {
            match self.step() {
                Ok(true) => {}
                Ok(false) => {
                    self.queue.signal().wait(self.poll_interval);
                }
                Err(e) => {
                    error!("Job master for {} failed to dispatch: {:#}", self.action(), e);
                    self.queue.signal().wait(self.poll_interval);
                }
            }
        }
        info!("Job master for {} stopped", self.action());
    }

    /// Claim and dispatch at most one job. Returns whether one was dispatched.
    pub fn step(&self) -> Result<bool> {
        let slot = match self.slots.acquire_interruptibly(&self.token) {
            Ok(slot) => HeldSlot {
                slots: self.slots.clone(),
                slot: Some(slot),
            },
            Err(PoolError::Interrupted) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let Some(job) = self.queue.store().claim_next(self.action(), now_millis())? else {
            return Ok(false);
        };
        let id = job.id.ok_or_else(|| anyhow!("Claimed job has no id"))?;
        debug!("Claimed {} job {}", self.action(), id);

        let action = match self.factory.create(&job) {
            Ok(action) => action,
            Err(e) => {
                warn!("Could not build action for {} job {}: {}", self.action(), id, e);
                fail_attempt(&self.queue, &self.policy, id, &e.to_string())?;
                return Ok(true);
            }
        };

        let claim = Claim {
            queue: self.queue.clone(),
            id,
            started: false,
            _slot: slot,
        };
        let policy = self.policy.clone();
        let name = format!("{} #{}", action.name(), id);
        let unit = Unit::callable(name, move |ctx: &TaskContext| {
            let mut claim = claim;
            claim.started = true;
            run_job(&claim.queue, &policy, job, action, ctx)
        });
        if let Err(e) = self.executor.submit(unit) {
            return Err(anyhow!("Could not submit {} job {}: {}", self.action(), id, e));
        }
        Ok(true)
    }
}

/// Run one claimed job and persist the outcome.
fn run_job(
    queue: &JobQueue,
    policy: &RetryPolicy,
    job: Job,
    mut action: Box<dyn JobAction>,
    ctx: &TaskContext,
) -> Result<()> {
    let id = job.id.ok_or_else(|| anyhow!("Job has no id"))?;
    let listeners = queue.listeners();
    for listener in &listeners {
        listener.on_processing(&job);
    }

    if !action.is_activated() {
        info!("{} job {} is not activated, finishing without running", queue.action(), id);
        return finish(queue, id);
    }

    let failure = match catch_unwind(AssertUnwindSafe(|| action.execute(ctx))) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{:#}", e)),
        Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
    };
    let Some(failure) = failure else {
        return finish(queue, id);
    };

    warn!("{} job {} failed: {}", queue.action(), id, failure);
    match catch_unwind(AssertUnwindSafe(|| action.rollback())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Rollback of {} job {} failed: {:#}", queue.action(), id, e),
        Err(panic) => error!(
            "Rollback of {} job {} panicked: {}",
            queue.action(),
            id,
            panic_message(panic.as_ref())
        ),
    }
    fail_attempt(queue, policy, id, &failure)?;
    Err(anyhow!(failure))
}

fn finish(queue: &JobQueue, id: i64) -> Result<()> {
    if !queue.store().mark_finished(id)? {
        warn!("{} job {} was no longer PROCESSING when it finished", queue.action(), id);
        return Ok(());
    }
    info!("{} job {} finished", queue.action(), id);
    if let Some(job) = queue.store().get(id)? {
        for listener in queue.listeners() {
            listener.on_finished(&job);
        }
    }
    Ok(())
}

/// PROCESSING to ERROR, then on to NEW or MAX_TRIES_EXCEEDED.
pub(crate) fn fail_attempt(
    queue: &JobQueue,
    policy: &RetryPolicy,
    id: i64,
    error: &str,
) -> Result<Option<Job>> {
    let Some(job) = queue.store().fail_attempt(id, error, policy)? else {
        warn!("{} job {} was no longer PROCESSING when it failed", queue.action(), id);
        return Ok(None);
    };
    report_failure(queue, policy, &job);
    Ok(Some(job))
}

/// Log where a failed job went and tell the queue's listeners.
pub(crate) fn report_failure(queue: &JobQueue, policy: &RetryPolicy, job: &Job) {
    let id = job.id.unwrap_or_default();
    match job.status {
        JobStatus::New => info!(
            "{} job {} will be retried in {}s (attempt {} of {})",
            queue.action(),
            id,
            policy.backoff_secs(job.tries),
            job.tries + 1,
            policy.max_tries
        ),
        JobStatus::MaxTriesExceeded => error!(
            "{} job {} gave up after {} tries",
            queue.action(),
            id,
            job.tries
        ),
        status => warn!("{} job {} failed but is {}", queue.action(), id, status),
    }
    for listener in queue.listeners() {
        listener.on_failed(job);
    }
}
