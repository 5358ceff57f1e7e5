//! Progress capabilities a unit of work can expose.

use std::sync::{Arc, Mutex};

/// Called with the new progress (0-100) and text after every update.
pub type ProgressListener = Arc<dyn Fn(Option<u8>, Option<&str>) + Send + Sync>;

/// A unit of work that can report how far along it is.
pub trait Progressive: Send + Sync {
    /// Completion percentage in `0..=100`, if known.
    fn progress(&self) -> Option<u8>;

    fn progress_text(&self) -> Option<String>;
}

/// A progress source that also pushes updates to registered listeners.
pub trait ProgressListenable: Progressive {
    fn add_progress_listener(&self, listener: ProgressListener);
}

/// What a wrapped unit of work can tell observers about itself.
#[derive(Clone, Default)]
pub enum Capability {
    #[default]
    Plain,
    Progressive(Arc<dyn Progressive>),
    Listenable(Arc<dyn ProgressListenable>),
}

impl Capability {
    pub fn is_progressive(&self) -> bool {
        !matches!(self, Capability::Plain)
    }

    pub fn progress(&self) -> Option<u8> {
        match self {
            Capability::Plain => None,
            Capability::Progressive(source) => source.progress(),
            Capability::Listenable(source) => source.progress(),
        }
    }

    pub fn progress_text(&self) -> Option<String> {
        match self {
            Capability::Plain => None,
            Capability::Progressive(source) => source.progress_text(),
            Capability::Listenable(source) => source.progress_text(),
        }
    }

    /// Forward a listener to the source. False if the source cannot push
    /// updates.
    pub fn add_progress_listener(&self, listener: ProgressListener) -> bool {
        match self {
            Capability::Listenable(source) => {
                source.add_progress_listener(listener);
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Plain => f.write_str("Plain"),
            Capability::Progressive(_) => f.write_str("Progressive"),
            Capability::Listenable(_) => f.write_str("Listenable"),
        }
    }
}

#[derive(Default)]
struct ReporterState {
    progress: Option<u8>,
    text: Option<String>,
    listeners: Vec<ProgressListener>,
}

/// Ready-made listenable progress source for work closures to update.
#[derive(Default)]
pub struct ProgressReporter {
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Set the percentage, clamped to 100.
    pub fn set_progress(&self, progress: u8) {
        self.update(Some(progress), None);
    }

    pub fn set_text(&self, text: impl Into<String>) {
        self.update(None, Some(text.into()));
    }

    /// Apply whichever fields are given and notify listeners.
    pub fn update(&self, progress: Option<u8>, text: Option<String>) {
        let (progress, text, listeners) = {
            let mut state = self.state.lock().unwrap();
            if let Some(p) = progress {
                state.progress = Some(p.min(100));
            }
            if text.is_some() {
                state.text = text;
            }
            (state.progress, state.text.clone(), state.listeners.clone())
        };
        // Notified outside the lock so listeners may read the reporter back
        for listener in listeners {
            listener(progress, text.as_deref());
        }
    }
}

impl Progressive for ProgressReporter {
    fn progress(&self) -> Option<u8> {
        self.state.lock().unwrap().progress
    }

    fn progress_text(&self) -> Option<String> {
        self.state.lock().unwrap().text.clone()
    }
}

impl ProgressListenable for ProgressReporter {
    fn add_progress_listener(&self, listener: ProgressListener) {
        self.state.lock().unwrap().listeners.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_reports_nothing() {
        let capability = Capability::Plain;
        assert_eq!(capability.progress(), None);
        assert_eq!(capability.progress_text(), None);
        assert!(!capability.add_progress_listener(Arc::new(
            |_: Option<u8>, _: Option<&str>| {}
        )));
    }

    #[test]
    fn test_reporter_clamps_and_keeps_text() {
        let reporter = ProgressReporter::new();
        reporter.set_text("indexing");
        reporter.set_progress(150);
        assert_eq!(reporter.progress(), Some(100));
        assert_eq!(reporter.progress_text().as_deref(), Some("indexing"));
    }

    #[test]
    fn test_listenable_capability_forwards_listener() {
        let reporter = ProgressReporter::new();
        let capability = Capability::Listenable(reporter.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        assert!(capability.add_progress_listener(Arc::new(
            move |progress: Option<u8>, text: Option<&str>| {
                sink.lock()
                    .unwrap()
                    .push((progress, text.map(str::to_string)));
            }
        )));

        reporter.update(Some(40), Some("step 2 of 5".to_string()));
        assert_eq!(capability.progress(), Some(40));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(Some(40), Some("step 2 of 5".to_string()))]
        );
    }
}
