//! Composition root for job processing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ExecutorSettings, JobsSettings, PoolSettings};
use crate::executor::PriorityExecutorService;
use crate::pool::ResourcePool;
use crate::processable::{ProcessableExecutor, ProcessableFactory, ProcessableRegistry};

use super::action::JobActionFactory;
use super::master::{report_failure, worker_slots, JobMaster, WorkerSlots};
use super::models::now_millis;
use super::queue::{JobQueue, JobQueues};
use super::retry_policy::RetryPolicy;
use super::store::{JobStore, SqliteJobStore};

/// Registry collection holding the tasks of running jobs.
pub const JOBS_COLLECTION: &str = "jobs";
/// Registry collection holding tasks submitted through [`JobRuntime::executor`].
pub const TASKS_COLLECTION: &str = "tasks";

/// Owns everything job processing needs: the store, the queues, the action
/// factories, the executors and one master thread per action type.
///
/// Created at startup, [`start`](Self::start)ed once every action is
/// registered, and [`close`](Self::close)d at shutdown.
pub struct JobRuntime {
    settings: JobsSettings,
    pool_settings: PoolSettings,
    queues: Arc<JobQueues>,
    registry: Arc<ProcessableRegistry>,
    job_service: Arc<PriorityExecutorService>,
    task_service: Arc<PriorityExecutorService>,
    job_executor: ProcessableExecutor,
    task_executor: ProcessableExecutor,
    slots: Arc<WorkerSlots>,
    policy: RetryPolicy,
    token: CancellationToken,
    factories: Mutex<BTreeMap<String, Arc<dyn JobActionFactory>>>,
    masters: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<RuntimeState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuntimeState {
    Created,
    Started,
    Closed,
}

impl JobRuntime {
    pub fn new(
        store: Arc<dyn JobStore>,
        settings: JobsSettings,
        executor_settings: ExecutorSettings,
        pool_settings: PoolSettings,
    ) -> Result<Self> {
        let registry = Arc::new(ProcessableRegistry::new());
        let factory = ProcessableFactory::new(registry.clone());

        let job_service = factory
            .new_pool("jobs", settings.worker_threads)
            .context("Failed to start job workers")?;
        let task_service = factory
            .new_pool("tasks", executor_settings.threads)
            .context("Failed to start task workers")?;
        let job_executor = factory.new_tracked_executor(job_service.clone(), JOBS_COLLECTION);
        let task_executor = factory.new_tracked_executor(task_service.clone(), TASKS_COLLECTION);

        Ok(Self {
            slots: Arc::new(worker_slots(settings.worker_threads)),
            policy: RetryPolicy::new(&settings),
            settings,
            pool_settings,
            queues: Arc::new(JobQueues::new(store)),
            registry,
            job_service,
            task_service,
            job_executor,
            task_executor,
            token: CancellationToken::new(),
            factories: Mutex::new(BTreeMap::new()),
            masters: Mutex::new(Vec::new()),
            state: Mutex::new(RuntimeState::Created),
        })
    }

    /// Open the SQLite store at `config.db_path` and build a runtime on it.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = SqliteJobStore::new(&config.db_path)?;
        Self::new(
            Arc::new(store),
            config.jobs.clone(),
            config.executor.clone(),
            config.pools.clone(),
        )
    }

    pub fn queues(&self) -> &Arc<JobQueues> {
        &self.queues
    }

    pub fn queue(&self, action: &str) -> Arc<JobQueue> {
        self.queues.queue(action)
    }

    pub fn registry(&self) -> &Arc<ProcessableRegistry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executor for in-process work that is not a persisted job. Its tasks
    /// are tracked in the [`TASKS_COLLECTION`] collection.
    pub fn executor(&self) -> &ProcessableExecutor {
        &self.task_executor
    }

    /// A resource pool sized with the configured default capacity.
    pub fn resource_pool<T, F>(&self, factory: F) -> ResourcePool<T>
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        ResourcePool::new(self.pool_settings.default_capacity, factory)
    }

    /// Register the factory building actions for jobs of type `action`.
    /// Registering after [`start`](Self::start) starts its master right away.
    /// Before start a second registration replaces the factory; once
    /// started, an action already running cannot be registered again.
    pub fn register_action<F>(&self, action: &str, factory: F) -> Result<Arc<JobQueue>>
    where
        F: JobActionFactory + 'static,
    {
        let factory: Arc<dyn JobActionFactory> = Arc::new(factory);
        let started = *self.state.lock().unwrap() == RuntimeState::Started;
        {
            let mut factories = self.factories.lock().unwrap();
            if started && factories.contains_key(action) {
                anyhow::bail!("Action {} already has a running master", action);
            }
            if factories
                .insert(action.to_string(), factory.clone())
                .is_some()
            {
                warn!("Action {} registered twice, replacing its factory", action);
            }
        }
        let queue = self.queues.queue(action);

        if started {
            self.spawn_master(queue.clone(), factory)?;
        }
        Ok(queue)
    }

    /// Recover jobs left PROCESSING for longer than the stale threshold,
    /// e.g. by a crash, counting each as a failed attempt. Jobs a crash left
    /// in ERROR are moved on too. Returns how many were recovered.
    pub fn reset_stale(&self) -> Result<usize> {
        let threshold_ms =
            i64::try_from(self.settings.stale_processing_threshold().as_millis()).unwrap_or(i64::MAX);
        let started_before = now_millis().saturating_sub(threshold_ms);

        let mut actions = self.queues.store().actions()?;
        actions.extend(self.queues.actions());
        actions.sort();
        actions.dedup();

        let mut recovered = 0;
        for action in actions {
            let queue = self.queues.queue(&action);
            for job in queue.store().reset_stale(&action, started_before, &self.policy)? {
                warn!(
                    "{} job {} was abandoned mid-attempt",
                    action,
                    job.id.unwrap_or_default()
                );
                report_failure(&queue, &self.policy, &job);
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Recovered {} stale jobs", recovered);
        }
        Ok(recovered)
    }

    /// Recover stale jobs and start one master per registered action.
    pub fn start(&self) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if *state != RuntimeState::Created {
                anyhow::bail!("Job runtime already {:?}", *state);
            }
        }
        self.reset_stale()?;

        let factories: Vec<_> = self
            .factories
            .lock()
            .unwrap()
            .iter()
            .map(|(action, factory)| (action.clone(), factory.clone()))
            .collect();
        *self.state.lock().unwrap() = RuntimeState::Started;
        for (action, factory) in factories {
            self.spawn_master(self.queues.queue(&action), factory)?;
        }
        info!(
            "Job runtime started with {} workers",
            self.settings.worker_threads
        );
        Ok(())
    }

    fn spawn_master(&self, queue: Arc<JobQueue>, factory: Arc<dyn JobActionFactory>) -> Result<()> {
        let master = JobMaster::new(
            queue.clone(),
            factory,
            self.job_executor.clone(),
            self.slots.clone(),
            self.policy.clone(),
            self.settings.poll_interval(),
            self.token.child_token(),
        );
        let handle = thread::Builder::new()
            .name(format!("master-{}", queue.action()))
            .spawn(move || master.run())
            .with_context(|| format!("Failed to spawn master for {}", queue.action()))?;
        self.masters.lock().unwrap().push(handle);
        Ok(())
    }

    /// Stop claiming jobs, let running and queued work drain, and join every
    /// thread. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == RuntimeState::Closed {
                return;
            }
            *state = RuntimeState::Closed;
        }
        info!("Closing job runtime");

        self.token.cancel();
        for queue in self.queues.all() {
            queue.signal().notify();
        }
        let masters = std::mem::take(&mut *self.masters.lock().unwrap());
        for master in masters {
            if master.join().is_err() {
                error!("Job master thread panicked");
            }
        }

        self.job_service.shutdown();
        self.task_service.shutdown();
        self.job_service.await_termination();
        self.task_service.await_termination();
        info!("Job runtime closed");
    }
}

impl Drop for JobRuntime {
    fn drop(&mut self) {
        self.close();
    }
}
