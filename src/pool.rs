//! Bounded pool of lazily created, reusable resources.
//!
//! Resources are built on demand by a factory until the pool reaches its
//! capacity; after that, callers block until someone hands a resource back.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often a blocked interruptible acquire re-checks its token.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Interrupted while waiting for a pooled resource")]
    Interrupted,

    #[error("Failed to create pooled resource: {0}")]
    Creation(#[source] anyhow::Error),
}

type Factory<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;

struct PoolState<T> {
    idle: Vec<T>,
    /// Number of resources handed out by the factory so far (including ones
    /// still being constructed).
    created: usize,
}

pub struct ResourcePool<T> {
    capacity: usize,
    factory: Factory<T>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

enum Slot<T> {
    Idle(T),
    Create,
}

impl<T> ResourcePool<T> {
    /// Create a pool that builds at most `capacity` resources with `factory`.
    ///
    /// A capacity of zero is treated as one.
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self {
            capacity: capacity.max(1),
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                created: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of resources constructed so far.
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    /// Number of resources currently sitting in the pool.
    pub fn idle(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }

    /// Take a resource, creating one if the pool is below capacity, blocking
    /// otherwise until another holder releases one.
    pub fn acquire(&self) -> Result<T, PoolError> {
        let slot = {
            let mut state = self.state.lock().unwrap();
            loop {
                if let Some(slot) = self.take_slot(&mut state) {
                    break slot;
                }
                state = self.available.wait(state).unwrap();
            }
        };
        self.fill_slot(slot)
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// [`PoolError::Interrupted`] once `token` is cancelled.
    pub fn acquire_interruptibly(&self, token: &CancellationToken) -> Result<T, PoolError> {
        let slot = {
            let mut state = self.state.lock().unwrap();
            loop {
                if token.is_cancelled() {
                    debug!("Pool acquire interrupted");
                    return Err(PoolError::Interrupted);
                }
                if let Some(slot) = self.take_slot(&mut state) {
                    break slot;
                }
                state = self
                    .available
                    .wait_timeout(state, INTERRUPT_POLL_INTERVAL)
                    .unwrap()
                    .0;
            }
        };
        self.fill_slot(slot)
    }

    /// Take a resource wrapped in a guard that gives it back on drop.
    pub fn lease(&self) -> Result<PoolLease<'_, T>, PoolError> {
        let resource = self.acquire()?;
        Ok(PoolLease {
            pool: self,
            resource: Some(resource),
        })
    }

    /// Return a resource to the pool and wake one waiter.
    pub fn release(&self, resource: T) {
        let mut state = self.state.lock().unwrap();
        state.idle.push(resource);
        self.available.notify_one();
    }

    fn take_slot(&self, state: &mut PoolState<T>) -> Option<Slot<T>> {
        if let Some(resource) = state.idle.pop() {
            return Some(Slot::Idle(resource));
        }
        if state.created < self.capacity {
            // Reserve the slot now so concurrent callers cannot overshoot.
            state.created += 1;
            return Some(Slot::Create);
        }
        None
    }

    fn fill_slot(&self, slot: Slot<T>) -> Result<T, PoolError> {
        match slot {
            Slot::Idle(resource) => Ok(resource),
            Slot::Create => match (self.factory)() {
                Ok(resource) => {
                    debug!("Created pooled resource ({} of {})", self.created(), self.capacity);
                    Ok(resource)
                }
                Err(e) => {
                    warn!("Pooled resource creation failed: {}", e);
                    let mut state = self.state.lock().unwrap();
                    state.created -= 1;
                    self.available.notify_one();
                    Err(PoolError::Creation(e))
                }
            },
        }
    }
}

/// A pooled resource that returns itself to its pool when dropped.
pub struct PoolLease<'a, T> {
    pool: &'a ResourcePool<T>,
    resource: Option<T>,
}

impl<T> Deref for PoolLease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("lease already released")
    }
}

impl<T> DerefMut for PoolLease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("lease already released")
    }
}

impl<T> Drop for PoolLease<'_, T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}
