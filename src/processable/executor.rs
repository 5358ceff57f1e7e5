use std::sync::Arc;

use anyhow::anyhow;
use tracing::warn;

use crate::executor::{
    ExecutorError, PriorityExecutorService, TaskContext, TaskError, DEFAULT_PRIORITY,
};

use super::collection::ProcessableCollection;
use super::status::ProcessableStatus;
use super::supplier::ProcessableSupplier;
use super::task::{FinishGuard, ProcessableTask};
use super::unit::Unit;

/// Submits [`Unit`]s to a priority executor and tracks each one as a
/// [`ProcessableTask`], optionally inside a collection.
#[derive(Clone)]
pub struct ProcessableExecutor {
    service: Arc<PriorityExecutorService>,
    collection: Option<Arc<ProcessableCollection>>,
}

impl ProcessableExecutor {
    pub fn new(
        service: Arc<PriorityExecutorService>,
        collection: Option<Arc<ProcessableCollection>>,
    ) -> Self {
        Self {
            service,
            collection,
        }
    }

    pub fn service(&self) -> &Arc<PriorityExecutorService> {
        &self.service
    }

    pub fn collection(&self) -> Option<&Arc<ProcessableCollection>> {
        self.collection.as_ref()
    }

    /// Submit with the default priority, behind any positive-priority work.
    pub fn submit<R: Send + 'static>(
        &self,
        unit: Unit<R>,
    ) -> Result<ProcessableSupplier<R>, ExecutorError> {
        self.submit_with_priority(unit, DEFAULT_PRIORITY)
    }

    pub fn submit_with_priority<R: Send + 'static>(
        &self,
        unit: Unit<R>,
        priority: i32,
    ) -> Result<ProcessableSupplier<R>, ExecutorError> {
        let (name, work, capability) = unit.into_parts();
        let task = Arc::new(ProcessableTask::new(name, capability));

        let runner = task.clone();
        let future = self
            .service
            .submit_with_priority(priority, move |ctx: &TaskContext| {
                if !runner.start() {
                    return Err(anyhow!("task {} was cancelled before start", runner.id()));
                }
                let guard = FinishGuard::new(&runner);
                match work(ctx) {
                    Ok(value) => {
                        if ctx.is_cancelled() {
                            guard.finish(
                                ProcessableStatus::Canceled,
                                Some("cancelled while running".to_string()),
                            );
                        } else {
                            guard.finish(ProcessableStatus::Successful, None);
                        }
                        Ok(value)
                    }
                    Err(e) => {
                        let status = if ctx.is_cancelled() {
                            ProcessableStatus::Canceled
                        } else {
                            warn!("Task {} ({}) failed: {:#}", runner.id(), runner.name(), e);
                            ProcessableStatus::Failed
                        };
                        guard.finish(status, Some(format!("{:#}", e)));
                        Err(e)
                    }
                }
            })?;

        task.bind(future.cancel_handle());
        let observed = task.clone();
        future.on_complete(move |result| {
            if let Err(TaskError::Cancelled) = result {
                observed.cancel_unstarted();
            }
        });

        if let Some(collection) = &self.collection {
            collection.add(task.clone());
            let collection = collection.clone();
            let id = task.id();
            future.on_complete(move |_| {
                collection.remove(id);
            });
        }

        Ok(ProcessableSupplier::new(task, future))
    }
}
