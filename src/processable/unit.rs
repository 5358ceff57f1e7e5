use std::sync::Arc;

use crate::executor::TaskContext;

use super::progress::{Capability, ProgressListenable, Progressive};

pub(crate) type Work<R> = Box<dyn FnOnce(&TaskContext) -> anyhow::Result<R> + Send>;

/// A named piece of work to submit to a
/// [`ProcessableExecutor`](super::ProcessableExecutor), plus the progress
/// capability observers can query while it runs.
pub struct Unit<R> {
    name: String,
    work: Work<R>,
    capability: Capability,
}

impl<R: Send + 'static> Unit<R> {
    /// Work that produces a value.
    pub fn callable<F>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(&TaskContext) -> anyhow::Result<R> + Send + 'static,
    {
        Self {
            name: name.into(),
            work: Box::new(work),
            capability: Capability::Plain,
        }
    }

    /// Expose `source` as this unit's progress.
    pub fn with_progress(mut self, source: Arc<dyn Progressive>) -> Self {
        self.capability = Capability::Progressive(source);
        self
    }

    /// Expose `source` as this unit's progress and let observers subscribe
    /// to its updates.
    pub fn with_listenable_progress(mut self, source: Arc<dyn ProgressListenable>) -> Self {
        self.capability = Capability::Listenable(source);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub(crate) fn into_parts(self) -> (String, Work<R>, Capability) {
        (self.name, self.work, self.capability)
    }
}

impl Unit<()> {
    /// Work with no result. Panics inside it fail the task.
    pub fn runnable<F>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        Self::callable(name, move |ctx| {
            work(ctx);
            Ok(())
        })
    }
}
