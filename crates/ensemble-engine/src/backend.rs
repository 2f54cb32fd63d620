//! The [`ExecutionBackend`] capability trait and shared execution helpers.
//!
//! A backend decides where units run. Only `kind` and `propagate` are
//! required; `prepare`, `run_worker` and `shutdown` have defaults, so a
//! backend that has no resources to acquire or no dedicated worker loop
//! only implements what it supports.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ensemble_core::{FailureCause, PropagateContext, Propagator, WorkUnit};

use crate::config::{BackendKind, WorkManagerConfig};
use crate::error::WorkError;

/// Units as the backend sees them.
pub type Units<P> = [WorkUnit<<P as Propagator>::Input, <P as Propagator>::Output>];

// ── ShutdownHandle ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ShutdownSignal {
    requested: AtomicBool,
    exit_code: AtomicI32,
}

/// Cloneable, thread-safe request to stop a work manager.
///
/// `propagate` holds the manager exclusively, so another thread (a signal
/// handler, a watchdog) asks for shutdown through this handle. A running
/// `propagate` stops dispatching, fails queued units as `Cancelled`,
/// waits up to the grace period for in-flight units and returns. The
/// first request's exit code is kept.
#[derive(Clone, Debug, Default)]
pub struct ShutdownHandle {
    signal: Arc<ShutdownSignal>,
}

impl ShutdownHandle {
    /// A fresh handle with no request recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown with `exit_code`. Later requests are ignored.
    pub fn request(&self, exit_code: i32) {
        if self
            .signal
            .requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.signal.exit_code.store(exit_code, Ordering::Release);
        }
    }

    /// `true` once shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.signal.requested.load(Ordering::Acquire)
    }

    /// Exit code of the first request, if any.
    pub fn exit_code(&self) -> Option<i32> {
        self.is_requested()
            .then(|| self.signal.exit_code.load(Ordering::Acquire))
    }
}

// ── ShutdownStats ──────────────────────────────────────────────────

/// What a backend reclaimed during [`ExecutionBackend::shutdown`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownStats {
    /// Threads joined or processes that exited on their own.
    pub workers_joined: usize,
    /// Threads still running after the grace period, left detached.
    pub workers_abandoned: usize,
    /// Processes killed after the grace period.
    pub workers_killed: usize,
}

// ── ExecutionBackend ───────────────────────────────────────────────

/// Strategy for running the units of a batch.
///
/// # Contract
///
/// - `propagate` returns only after every unit in `units` is `Complete`
///   or `Failed`. Unit failures are recorded on the units; `Err` is for
///   failures of the backend itself and for inputs that cannot be
///   dispatched at all.
/// - A unit is held by at most one worker at a time.
/// - `shutdown` never fails; problems while reclaiming are logged.
pub trait ExecutionBackend<P: Propagator>: Send {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Acquire resources (threads, processes). Called once by the manager
    /// before the first iteration. Default: nothing to acquire.
    fn prepare(&mut self, propagator: &Arc<P>, config: &WorkManagerConfig) -> Result<(), WorkError> {
        let _ = (propagator, config);
        Ok(())
    }

    /// Run every unit of `units` to resolution.
    fn propagate(
        &mut self,
        propagator: &Arc<P>,
        units: &mut Units<P>,
        shutdown: &ShutdownHandle,
    ) -> Result<(), WorkError>;

    /// Serve a master as a dedicated worker until told to stop.
    ///
    /// Default: [`WorkError::UnsupportedOperation`].
    fn run_worker(&mut self, propagator: &Arc<P>) -> Result<(), WorkError> {
        let _ = propagator;
        Err(WorkError::UnsupportedOperation {
            operation: "run_worker",
            backend: self.kind(),
        })
    }

    /// Release resources, waiting at most `grace` for in-flight work.
    /// Default: nothing to release.
    fn shutdown(&mut self, grace: Duration) -> ShutdownStats {
        let _ = grace;
        ShutdownStats::default()
    }
}

// ── Execution helpers ──────────────────────────────────────────────

/// Invoke the propagator on `units` and make sure each one resolves.
///
/// An `Err` from the propagator, a panic, or a unit left unresolved all
/// become a `Propagator` failure on the affected units. A panic never
/// escapes, so pool threads survive a misbehaving propagator.
pub(crate) fn execute_units<P: Propagator>(
    propagator: &P,
    units: &mut Units<P>,
    ctx: &PropagateContext<'_>,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| propagator.propagate(units, ctx)));
    let reason = match outcome {
        Ok(Ok(())) => "propagator returned without resolving the unit".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("propagator panicked: {}", panic_message(payload.as_ref())),
    };
    for unit in units.iter_mut().filter(|u| !u.is_resolved()) {
        unit.fail_with(FailureCause::Propagator, reason.clone());
    }
}

/// Cancel every unresolved unit in `units`.
pub(crate) fn cancel_unresolved<I, O>(units: &mut [WorkUnit<I, O>], reason: &str) -> usize {
    let mut cancelled = 0;
    for unit in units.iter_mut().filter(|u| !u.is_resolved()) {
        unit.fail_with(FailureCause::Cancelled, reason);
        cancelled += 1;
    }
    cancelled
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
