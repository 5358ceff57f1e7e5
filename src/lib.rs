//! Docket: concurrent task scheduling and persisted job processing.
//!
//! - [`pool`]: bounded pool of lazily created, reusable resources.
//! - [`executor`]: priority-ordered worker pool returning cancellable futures.
//! - [`processable`]: tracked tasks with status, progress and collections.
//! - [`jobs`]: persisted jobs with deduplicating queues, retries and rollback.

pub mod config;
pub mod executor;
pub mod jobs;
pub mod pool;
pub mod processable;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use executor::{PriorityExecutorService, TaskContext, TaskError, TaskFuture};
pub use jobs::{
    ActionError, Job, JobAction, JobParameters, JobQueue, JobRuntime, JobStatus, JobStore,
    SqliteJobStore,
};
pub use pool::{PoolError, ResourcePool};
pub use processable::{ProcessableExecutor, ProcessableStatus, ProcessableSupplier, Unit};
