use thiserror::Error;

use crate::executor::TaskContext;

use super::models::Job;

/// Errors raised by job actions.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Missing job parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid job parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("{0:#}")]
    Failed(#[from] anyhow::Error),
}

/// The work behind one persisted [`Job`].
///
/// An action is built for a single job by its [`JobActionFactory`] right
/// before execution, and dropped once the job has been moved to its next
/// status.
pub trait JobAction: Send {
    /// Human-readable name, used in logs and as the tracked task name.
    fn name(&self) -> String;

    /// Whether the action should run at all. A job whose action is not
    /// activated is finished without calling [`execute`](Self::execute).
    fn is_activated(&self) -> bool {
        true
    }

    /// Perform the work. Long-running actions should check
    /// `ctx.is_cancelled()` and return [`ActionError::Cancelled`].
    fn execute(&mut self, ctx: &TaskContext) -> Result<(), ActionError>;

    /// Undo whatever a failed [`execute`](Self::execute) left behind.
    fn rollback(&mut self) -> Result<(), ActionError> {
        Ok(())
    }
}

/// Builds the [`JobAction`] for a job of one action type.
pub trait JobActionFactory: Send + Sync {
    fn create(&self, job: &Job) -> Result<Box<dyn JobAction>, ActionError>;
}

impl<F> JobActionFactory for F
where
    F: Fn(&Job) -> Result<Box<dyn JobAction>, ActionError> + Send + Sync,
{
    fn create(&self, job: &Job) -> Result<Box<dyn JobAction>, ActionError> {
        self(job)
    }
}

/// Fetch a required parameter or fail with [`ActionError::MissingParameter`].
pub fn required_param<'a>(job: &'a Job, key: &str) -> Result<&'a str, ActionError> {
    job.param(key)
        .ok_or_else(|| ActionError::MissingParameter(key.to_string()))
}
