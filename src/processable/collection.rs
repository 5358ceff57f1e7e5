//! Observable named sets of live tasks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::task::ProcessableTask;

/// Notified when tasks enter or leave a [`ProcessableCollection`].
pub trait CollectionListener: Send + Sync {
    fn on_added(&self, _collection: &ProcessableCollection, _task: &Arc<ProcessableTask>) {}

    fn on_removed(&self, _collection: &ProcessableCollection, _task: &Arc<ProcessableTask>) {}
}

/// Named set of live tasks with free-form string properties.
///
/// Executors built against a collection add each task when it is submitted
/// and remove it once its future completes.
pub struct ProcessableCollection {
    name: String,
    properties: Mutex<BTreeMap<String, String>>,
    tasks: Mutex<BTreeMap<u64, Arc<ProcessableTask>>>,
    listeners: Mutex<Vec<Arc<dyn CollectionListener>>>,
}

impl ProcessableCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties
            .lock()
            .unwrap()
            .insert(key.into(), value.into());
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().unwrap().get(key).cloned()
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.properties.lock().unwrap().clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn CollectionListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Add a task. False if it is already present.
    pub fn add(&self, task: Arc<ProcessableTask>) -> bool {
        {
            let mut tasks = self.tasks.lock().unwrap();
            if tasks.contains_key(&task.id()) {
                return false;
            }
            tasks.insert(task.id(), task.clone());
        }
        debug!("Collection {}: added task {}", self.name, task.id());
        for listener in self.listeners() {
            listener.on_added(self, &task);
        }
        true
    }

    /// Remove a task by id. Listeners hear about each removal once.
    pub fn remove(&self, id: u64) -> Option<Arc<ProcessableTask>> {
        let task = self.tasks.lock().unwrap().remove(&id)?;
        debug!("Collection {}: removed task {}", self.name, id);
        for listener in self.listeners() {
            listener.on_removed(self, &task);
        }
        Some(task)
    }

    pub fn get(&self, id: u64) -> Option<Arc<ProcessableTask>> {
        self.tasks.lock().unwrap().get(&id).cloned()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.tasks.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live tasks in submission order.
    pub fn tasks(&self) -> Vec<Arc<ProcessableTask>> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }

    fn listeners(&self) -> Vec<Arc<dyn CollectionListener>> {
        self.listeners.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for ProcessableCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessableCollection")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processable::progress::Capability;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl CollectionListener for Counting {
        fn on_added(&self, _: &ProcessableCollection, _: &Arc<ProcessableTask>) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn on_removed(&self, _: &ProcessableCollection, _: &Arc<ProcessableTask>) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_add_and_remove_notify_once() {
        let collection = ProcessableCollection::new("imports");
        let counting = Arc::new(Counting::default());
        collection.add_listener(counting.clone());

        let task = Arc::new(ProcessableTask::new("a".to_string(), Capability::Plain));
        assert!(collection.add(task.clone()));
        assert!(!collection.add(task.clone()));
        assert!(collection.contains(task.id()));

        assert!(collection.remove(task.id()).is_some());
        assert!(collection.remove(task.id()).is_none());
        assert!(collection.is_empty());

        assert_eq!(counting.added.load(Ordering::SeqCst), 1);
        assert_eq!(counting.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_properties() {
        let collection = ProcessableCollection::new("imports");
        collection.set_property("owner", "admin");
        collection.set_property("owner", "curator");
        assert_eq!(collection.property("owner").as_deref(), Some("curator"));
        assert_eq!(collection.property("missing"), None);
        assert_eq!(collection.properties().len(), 1);
    }
}
