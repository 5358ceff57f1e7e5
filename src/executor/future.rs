//! Listenable, cancellable handle on the result of a submitted computation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::service::panic_message;

/// Why a submitted computation produced no value.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task failed: {0:#}")]
    Failed(#[source] anyhow::Error),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

pub type TaskResult<R> = Result<R, TaskError>;

type Listener<R> = Box<dyn FnOnce(&TaskResult<R>) + Send>;

/// Handed to a running computation so it can observe cancellation.
#[derive(Clone)]
pub struct TaskContext {
    interrupt: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

impl TaskContext {
    /// True once the computation has been asked to stop, with or without
    /// interruption. Long-running work should check this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst) || self.interrupt.is_cancelled()
    }

    /// True once cancellation with interruption has been requested.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Token cancelled on interruption, for passing to blocking primitives
    /// such as [`ResourcePool::acquire_interruptibly`](crate::pool::ResourcePool::acquire_interruptibly).
    pub fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }
}

enum State<R> {
    Pending,
    Running,
    /// Outcome decided, listeners are being told about it.
    Settling { cancelled: bool },
    Completed(TaskResult<R>),
    /// The result was moved out by [`TaskFuture::get`].
    Taken,
}

struct Inner<R> {
    state: State<R>,
    listeners: Vec<Listener<R>>,
}

struct Shared<R> {
    inner: Mutex<Inner<R>>,
    done: Condvar,
    context: TaskContext,
}

impl<R> Shared<R> {
    /// Store the outcome and run the registered listeners.
    ///
    /// Returns `None` if the future had already completed, otherwise whether
    /// a worker was running the computation at that point. Listeners run
    /// without the state lock held, but waiters only wake up once all of
    /// them saw the outcome.
    fn settle(&self, result: TaskResult<R>, allow_pending: bool) -> Option<bool> {
        let (was_running, listeners) = {
            let mut inner = self.inner.lock().unwrap();
            let was_running = match inner.state {
                State::Running => true,
                State::Pending if allow_pending => false,
                _ => return None,
            };
            let cancelled = matches!(result, Err(TaskError::Cancelled));
            if cancelled {
                self.context.cancel_requested.store(true, Ordering::SeqCst);
            }
            inner.state = State::Settling { cancelled };
            (was_running, std::mem::take(&mut inner.listeners))
        };
        self.deliver(result, listeners);
        Some(was_running)
    }

    /// Hand `result` to `listeners` and to any registered meanwhile, then
    /// publish it and wake the waiters.
    fn deliver(&self, result: TaskResult<R>, mut listeners: Vec<Listener<R>>) {
        loop {
            for listener in listeners.drain(..) {
                notify(listener, &result);
            }
            let mut inner = self.inner.lock().unwrap();
            if inner.listeners.is_empty() {
                inner.state = State::Completed(result);
                self.done.notify_all();
                return;
            }
            listeners = std::mem::take(&mut inner.listeners);
        }
    }

    fn request_cancel(&self, may_interrupt: bool) -> bool {
        match self.settle(Err(TaskError::Cancelled), true) {
            None => false,
            Some(was_running) => {
                if may_interrupt && was_running {
                    self.context.interrupt.cancel();
                }
                true
            }
        }
    }
}

/// A panicking listener must not take the completing thread down with it.
fn notify<R>(listener: Listener<R>, result: &TaskResult<R>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(result))) {
        error!("Completion listener panicked: {}", panic_message(panic.as_ref()));
    }
}

trait Cancel: Send + Sync {
    fn cancel(&self, may_interrupt: bool) -> bool;
}

impl<R: Send> Cancel for Shared<R> {
    fn cancel(&self, may_interrupt: bool) -> bool {
        self.request_cancel(may_interrupt)
    }
}

/// Cancels a submission without knowing its result type.
#[derive(Clone)]
pub struct CancelHandle {
    target: Arc<dyn Cancel>,
}

impl CancelHandle {
    /// Same as [`TaskFuture::cancel`].
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.target.cancel(may_interrupt)
    }
}

/// Result handle returned for every submission.
pub struct TaskFuture<R> {
    shared: Arc<Shared<R>>,
}

/// Worker-side half of a [`TaskFuture`].
pub(crate) struct Completer<R> {
    shared: Arc<Shared<R>>,
}

pub(crate) fn task_future<R>() -> (TaskFuture<R>, Completer<R>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            state: State::Pending,
            listeners: Vec::new(),
        }),
        done: Condvar::new(),
        context: TaskContext {
            interrupt: CancellationToken::new(),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        },
    });
    (
        TaskFuture {
            shared: shared.clone(),
        },
        Completer { shared },
    )
}

impl<R: Send + 'static> TaskFuture<R> {
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            target: self.shared.clone(),
        }
    }
}

impl<R> TaskFuture<R> {
    pub fn is_done(&self) -> bool {
        matches!(
            self.shared.inner.lock().unwrap().state,
            State::Settling { .. } | State::Completed(_) | State::Taken
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.inner.lock().unwrap().state,
            State::Settling { cancelled: true } | State::Completed(Err(TaskError::Cancelled))
        )
    }

    /// Whether a worker has picked the computation up.
    pub fn is_started(&self) -> bool {
        !matches!(self.shared.inner.lock().unwrap().state, State::Pending)
    }

    /// Cancel the computation.
    ///
    /// A computation that has not started yet will never run. One that is
    /// running is only asked to stop: with `may_interrupt` its context's
    /// interrupt token is cancelled. Either way the future completes
    /// immediately with [`TaskError::Cancelled`]. Returns false if the
    /// future had already completed.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.shared.request_cancel(may_interrupt)
    }

    /// Register a callback for the outcome.
    ///
    /// Runs on the thread that completes the future, or right away on the
    /// calling thread if it is already complete. A panicking callback is
    /// logged and otherwise ignored.
    pub fn on_complete<F>(&self, listener: F)
    where
        F: FnOnce(&TaskResult<R>) + Send + 'static,
    {
        let mut inner = self.shared.inner.lock().unwrap();
        let completed = match inner.state {
            State::Completed(Err(TaskError::Cancelled)) => Some(true),
            State::Completed(_) => Some(false),
            State::Taken => return,
            _ => None,
        };
        let Some(cancelled) = completed else {
            inner.listeners.push(Box::new(listener));
            return;
        };
        let State::Completed(result) =
            std::mem::replace(&mut inner.state, State::Settling { cancelled })
        else {
            return;
        };
        drop(inner);
        self.shared.deliver(result, vec![Box::new(listener)]);
    }

    /// Block until the future completes.
    pub fn wait(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        while matches!(
            inner.state,
            State::Pending | State::Running | State::Settling { .. }
        ) {
            inner = self.shared.done.wait(inner).unwrap();
        }
    }

    /// Block until the future completes and take its outcome.
    pub fn get(self) -> TaskResult<R> {
        let mut inner = self.shared.inner.lock().unwrap();
        while matches!(
            inner.state,
            State::Pending | State::Running | State::Settling { .. }
        ) {
            inner = self.shared.done.wait(inner).unwrap();
        }
        match std::mem::replace(&mut inner.state, State::Taken) {
            State::Completed(result) => result,
            // Only `get(self)` takes, and it consumes the single handle
            _ => Err(TaskError::Cancelled),
        }
    }
}

impl<R> Completer<R> {
    /// Move the future from pending to running. False if it was cancelled
    /// before a worker got to it.
    pub fn try_start(&self) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.state {
            State::Pending => {
                inner.state = State::Running;
                true
            }
            _ => false,
        }
    }

    pub fn context(&self) -> TaskContext {
        self.shared.context.clone()
    }

    /// Publish the outcome. Ignored if the future was cancelled meanwhile.
    pub fn complete(&self, result: TaskResult<R>) -> bool {
        self.shared.settle(result, false).is_some()
    }

    /// Cancel a computation that never started, e.g. on executor shutdown.
    pub fn cancel(&self) -> bool {
        self.shared.settle(Err(TaskError::Cancelled), true).is_some()
    }
}
