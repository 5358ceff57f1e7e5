//! Worker-thread pool whose queue is ordered by submission priority.

use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info};

use super::future::{task_future, Completer, TaskContext, TaskError, TaskFuture};
use super::priority::{PriorityEntry, DEFAULT_PRIORITY};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Executor {0} is shut down")]
    Shutdown(String),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Type-erased queued computation.
trait QueuedTask: Send {
    fn run(self: Box<Self>);
    fn cancel(&self);
}

struct FutureTask<R, F> {
    completer: Completer<R>,
    work: F,
}

impl<R, F> QueuedTask for FutureTask<R, F>
where
    R: Send + 'static,
    F: FnOnce(&TaskContext) -> anyhow::Result<R> + Send + 'static,
{
    fn run(self: Box<Self>) {
        let FutureTask { completer, work } = *self;
        if !completer.try_start() {
            // Cancelled while queued
            return;
        }
        let ctx = completer.context();
        let result = match catch_unwind(AssertUnwindSafe(|| work(&ctx))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TaskError::Failed(e)),
            Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
        };
        completer.complete(result);
    }

    fn cancel(&self) {
        self.completer.cancel();
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct QueueState {
    heap: BinaryHeap<PriorityEntry<Box<dyn QueuedTask>>>,
    next_sequence: u64,
    shutdown: bool,
}

struct Shared {
    name: String,
    queue: Mutex<QueueState>,
    available: Condvar,
}

/// Thread pool that always runs the most urgent queued submission next.
///
/// Ordering is by priority (larger first), then by submission order. There
/// is no aging: low-priority work waits for as long as more urgent work keeps
/// arriving.
pub struct PriorityExecutorService {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl PriorityExecutorService {
    /// Start a pool named `name` with `threads` workers (at least one).
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self, ExecutorError> {
        let name = name.into();
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            name: name.clone(),
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || worker_loop(worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!("Executor {} failed to spawn worker {}: {}", name, i, e);
                    // Let the workers already running exit
                    shared.queue.lock().unwrap().shutdown = true;
                    shared.available.notify_all();
                    return Err(e.into());
                }
            }
        }
        info!("Executor {} started with {} worker threads", name, threads);

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            threads,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Submit with [`DEFAULT_PRIORITY`].
    pub fn submit<R, F>(&self, work: F) -> Result<TaskFuture<R>, ExecutorError>
    where
        R: Send + 'static,
        F: FnOnce(&TaskContext) -> anyhow::Result<R> + Send + 'static,
    {
        self.submit_with_priority(DEFAULT_PRIORITY, work)
    }

    /// Queue `work` with the given priority and return its future.
    pub fn submit_with_priority<R, F>(
        &self,
        priority: i32,
        work: F,
    ) -> Result<TaskFuture<R>, ExecutorError>
    where
        R: Send + 'static,
        F: FnOnce(&TaskContext) -> anyhow::Result<R> + Send + 'static,
    {
        let (future, completer) = task_future();
        let task: Box<dyn QueuedTask> = Box::new(FutureTask { completer, work });

        let mut queue = self.shared.queue.lock().unwrap();
        if queue.shutdown {
            return Err(ExecutorError::Shutdown(self.shared.name.clone()));
        }
        let sequence = queue.next_sequence;
        queue.next_sequence += 1;
        queue.heap.push(PriorityEntry::new(task, priority, sequence));
        self.shared.available.notify_one();
        Ok(future)
    }

    /// Number of submissions waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().unwrap().heap.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.queue.lock().unwrap().shutdown
    }

    /// Stop accepting submissions. Already queued work still runs.
    pub fn shutdown(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        if !queue.shutdown {
            debug!("Executor {} shutting down", self.shared.name);
            queue.shutdown = true;
        }
        self.shared.available.notify_all();
    }

    /// Stop accepting submissions and cancel everything still queued.
    /// Returns how many queued submissions were cancelled.
    pub fn shutdown_now(&self) -> usize {
        let drained: Vec<_> = {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.shutdown = true;
            self.shared.available.notify_all();
            queue.heap.drain().collect()
        };
        // Cancel outside the queue lock: cancellation runs future listeners
        for entry in &drained {
            entry.payload().cancel();
        }
        info!(
            "Executor {} shut down, {} queued tasks cancelled",
            self.shared.name,
            drained.len()
        );
        drained.len()
    }

    /// Block until every worker has exited. Call after one of the shutdown
    /// methods, never from a worker thread.
    pub fn await_termination(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            if worker.join().is_err() {
                error!("Executor {} worker thread panicked", self.shared.name);
            }
        }
        debug!("Executor {} terminated", self.shared.name);
    }
}

impl Drop for PriorityExecutorService {
    fn drop(&mut self) {
        // Workers exit on their own once the queue drains
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(entry) = queue.heap.pop() {
                    break entry.into_payload();
                }
                if queue.shutdown {
                    return;
                }
                queue = shared.available.wait(queue).unwrap();
            }
        };
        task.run();
    }
}
