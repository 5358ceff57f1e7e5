mod future;
mod priority;
mod service;

pub use future::{CancelHandle, TaskContext, TaskError, TaskFuture, TaskResult};
pub use priority::{PriorityEntry, DEFAULT_PRIORITY};
pub use service::{ExecutorError, PriorityExecutorService};

pub(crate) use service::panic_message;
