use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use super::collection::ProcessableCollection;
use super::task::ProcessableTask;

/// Application-wide index of named collections, owned by the composition
/// root and handed to whoever submits or observes tasks.
#[derive(Default)]
pub struct ProcessableRegistry {
    collections: Mutex<BTreeMap<String, Arc<ProcessableCollection>>>,
}

impl ProcessableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the collection called `name`, creating it on first use.
    pub fn collection(&self, name: &str) -> Arc<ProcessableCollection> {
        self.collections
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ProcessableCollection::new(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcessableCollection>> {
        self.collections.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.lock().unwrap().keys().cloned().collect()
    }

    /// Every live task across all collections.
    pub fn live_tasks(&self) -> Vec<Arc<ProcessableTask>> {
        let collections: Vec<_> = self.collections.lock().unwrap().values().cloned().collect();
        collections.iter().flat_map(|c| c.tasks()).collect()
    }

    /// Cancel every live task. Returns how many accepted the cancellation.
    pub fn close(&self, may_interrupt: bool) -> usize {
        let cancelled = self
            .live_tasks()
            .iter()
            .filter(|task| task.cancel(may_interrupt))
            .count();
        info!("Processable registry closed, {} live tasks cancelled", cancelled);
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_is_created_once() {
        let registry = ProcessableRegistry::new();
        let a = registry.collection("jobs");
        let b = registry.collection("jobs");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.get("other").is_none());
        assert_eq!(registry.names(), vec!["jobs".to_string()]);
    }
}
