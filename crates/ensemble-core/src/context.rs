//! [`PropagateContext`]: what a propagator sees while propagating.
//!
//! Besides identifying the iteration and worker, the context carries the
//! backend-held propagation lock when the propagator is not thread-safe.
//! [`isolated`](PropagateContext::isolated) releases that lock around a
//! blocking sub-operation that touches no shared propagator state, so
//! other pool threads can make progress meanwhile.

use std::cell::RefCell;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::id::{IterationId, WorkerId};

/// Per-call context handed to [`Propagator::propagate`](crate::Propagator::propagate).
pub struct PropagateContext<'a> {
    iteration: IterationId,
    worker: Option<WorkerId>,
    lock: Option<&'a Mutex<()>>,
    guard: RefCell<Option<MutexGuard<'a, ()>>>,
}

impl<'a> PropagateContext<'a> {
    /// Context with no propagation lock (serial execution, dedicated
    /// worker processes, thread-safe propagators).
    pub fn unlocked(iteration: IterationId, worker: Option<WorkerId>) -> Self {
        Self {
            iteration,
            worker,
            lock: None,
            guard: RefCell::new(None),
        }
    }

    /// Context that holds `lock` for its whole lifetime except inside
    /// [`isolated`](Self::isolated). Blocks until the lock is acquired.
    pub fn locked(iteration: IterationId, worker: Option<WorkerId>, lock: &'a Mutex<()>) -> Self {
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        Self {
            iteration,
            worker,
            lock: Some(lock),
            guard: RefCell::new(Some(guard)),
        }
    }

    /// Iteration being propagated.
    pub fn iteration(&self) -> IterationId {
        self.iteration
    }

    /// Worker slot executing this call, if the backend has slots.
    pub fn worker(&self) -> Option<WorkerId> {
        self.worker
    }

    /// `true` while this context holds the propagation lock.
    pub fn holds_lock(&self) -> bool {
        self.guard.borrow().is_some()
    }

    /// Run `f` with the propagation lock released, reacquiring it after.
    ///
    /// `f` must not touch state the propagator shares between calls; it
    /// is meant for waiting on a subprocess or other external work.
    pub fn isolated<R>(&self, f: impl FnOnce() -> R) -> R {
        let released = self.guard.borrow_mut().take();
        let was_held = released.is_some();
        drop(released);

        let out = f();

        if was_held {
            if let Some(lock) = self.lock {
                let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                *self.guard.borrow_mut() = Some(guard);
            }
        }
        out
    }
}

impl std::fmt::Debug for PropagateContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagateContext")
            .field("iteration", &self.iteration)
            .field("worker", &self.worker)
            .field("holds_lock", &self.holds_lock())
            .finish()
    }
}
