//! Tracked in-process work: status, timestamps, progress and observable
//! collections on top of the priority executor.

mod collection;
mod executor;
mod factory;
mod progress;
mod registry;
mod status;
mod supplier;
mod task;
mod unit;

pub use collection::{CollectionListener, ProcessableCollection};
pub use executor::ProcessableExecutor;
pub use factory::ProcessableFactory;
pub use progress::{Capability, ProgressListenable, ProgressListener, ProgressReporter, Progressive};
pub use registry::ProcessableRegistry;
pub use status::ProcessableStatus;
pub use supplier::ProcessableSupplier;
pub use task::{ProcessableTask, StatusListener};
pub use unit::Unit;
