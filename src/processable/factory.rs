use std::sync::Arc;

use crate::executor::{ExecutorError, PriorityExecutorService};

use super::collection::ProcessableCollection;
use super::executor::ProcessableExecutor;
use super::registry::ProcessableRegistry;

/// Builds executor pools and the [`ProcessableExecutor`]s that feed them.
#[derive(Clone)]
pub struct ProcessableFactory {
    registry: Arc<ProcessableRegistry>,
}

impl ProcessableFactory {
    pub fn new(registry: Arc<ProcessableRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProcessableRegistry> {
        &self.registry
    }

    pub fn new_pool(
        &self,
        name: &str,
        threads: usize,
    ) -> Result<Arc<PriorityExecutorService>, ExecutorError> {
        Ok(Arc::new(PriorityExecutorService::new(name, threads)?))
    }

    pub fn new_executor(
        &self,
        service: Arc<PriorityExecutorService>,
        collection: Option<Arc<ProcessableCollection>>,
    ) -> ProcessableExecutor {
        ProcessableExecutor::new(service, collection)
    }

    /// Executor whose tasks are tracked in the registry collection called
    /// `collection`.
    pub fn new_tracked_executor(
        &self,
        service: Arc<PriorityExecutorService>,
        collection: &str,
    ) -> ProcessableExecutor {
        ProcessableExecutor::new(service, Some(self.registry.collection(collection)))
    }
}
