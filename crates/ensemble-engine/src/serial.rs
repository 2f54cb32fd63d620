//! Serial backend: every unit runs in the calling thread, in order.

use std::marker::PhantomData;
use std::slice;
use std::sync::Arc;

use ensemble_core::{PropagateContext, Propagator};
use tracing::debug;

use crate::backend::{cancel_unresolved, execute_units, ExecutionBackend, ShutdownHandle, Units};
use crate::config::BackendKind;
use crate::error::WorkError;

/// Runs units one at a time in submission order. No parallelism.
///
/// A shutdown request is honoured between units: the unit in progress
/// finishes, the rest are cancelled.
pub struct SerialBackend<P> {
    _marker: PhantomData<fn() -> P>,
}

impl<P> SerialBackend<P> {
    /// Create a serial backend.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<P> Default for SerialBackend<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Propagator> ExecutionBackend<P> for SerialBackend<P> {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    fn propagate(
        &mut self,
        propagator: &Arc<P>,
        units: &mut Units<P>,
        shutdown: &ShutdownHandle,
    ) -> Result<(), WorkError> {
        for index in 0..units.len() {
            if shutdown.is_requested() {
                let cancelled =
                    cancel_unresolved(&mut units[index..], "shutdown requested before dispatch");
                debug!(cancelled, "serial backend stopped on shutdown request");
                break;
            }
            let unit = &mut units[index];
            debug!(unit = %unit.id(), "running unit");
            unit.begin();
            let ctx = PropagateContext::unlocked(unit.iteration(), None);
            execute_units(&**propagator, slice::from_mut(unit), &ctx);
        }
        Ok(())
    }
}
