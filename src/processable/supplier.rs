use std::sync::Arc;

use crate::executor::{TaskFuture, TaskResult};

use super::progress::ProgressListener;
use super::status::ProcessableStatus;
use super::task::{ProcessableTask, StatusListener};

/// A submitted unit of work: its observable [`ProcessableTask`] bound to the
/// future carrying its result.
pub struct ProcessableSupplier<R> {
    task: Arc<ProcessableTask>,
    future: TaskFuture<R>,
}

impl<R> ProcessableSupplier<R> {
    pub(crate) fn new(task: Arc<ProcessableTask>, future: TaskFuture<R>) -> Self {
        Self { task, future }
    }

    pub fn task(&self) -> &Arc<ProcessableTask> {
        &self.task
    }

    pub fn id(&self) -> u64 {
        self.task.id()
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn status(&self) -> ProcessableStatus {
        self.task.status()
    }

    pub fn error(&self) -> Option<String> {
        self.task.error()
    }

    /// `None` when the wrapped work does not report progress.
    pub fn progress(&self) -> Option<u8> {
        self.task.progress()
    }

    pub fn progress_text(&self) -> Option<String> {
        self.task.progress_text()
    }

    pub fn add_progress_listener(&self, listener: ProgressListener) -> bool {
        self.task.add_progress_listener(listener)
    }

    pub fn add_status_listener(&self, listener: StatusListener) {
        self.task.add_status_listener(listener);
    }

    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.future.is_cancelled()
    }

    /// Forward cancellation to the future. False once the task is terminal.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self.task.status().is_terminal() {
            return false;
        }
        self.future.cancel(may_interrupt)
    }

    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&TaskResult<R>) + Send + 'static,
    {
        self.future.on_complete(listener);
    }

    /// Block until the result is available.
    pub fn wait(&self) {
        self.future.wait();
    }

    /// Block until done and take the result.
    pub fn get(self) -> TaskResult<R> {
        self.future.get()
    }
}

impl<R> std::fmt::Debug for ProcessableSupplier<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessableSupplier")
            .field("task", &self.task)
            .field("done", &self.is_done())
            .finish()
    }
}
