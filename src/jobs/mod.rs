//! Persisted, retryable background jobs.

mod action;
mod listener;
mod master;
mod models;
mod queue;
mod retry_policy;
mod runtime;
mod schema;
mod store;

pub use action::{required_param, ActionError, JobAction, JobActionFactory};
pub use listener::JobStatusListener;
pub use master::JobMaster;
pub use models::{Job, JobCounts, JobParameters, JobStatus};
pub use queue::{JobQueue, JobQueues};
pub use retry_policy::RetryPolicy;
pub use runtime::{JobRuntime, JOBS_COLLECTION, TASKS_COLLECTION};
pub use store::{JobStore, SqliteJobStore};
