//! The [`Propagator`] trait and [`Concurrency`] declaration.
//!
//! A propagator is the driver-supplied collaborator that performs the
//! actual computation for a work unit. The work manager never looks at
//! payloads; it only decides where and when `propagate` runs.

use crate::context::PropagateContext;
use crate::error::PropagatorError;
use crate::id::IterationId;
use crate::payload::WirePayload;
use crate::unit::WorkUnit;

/// Whether a propagator may be called from several threads at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Concurrency {
    /// Calls are serialized by a backend-held lock, except inside
    /// [`PropagateContext::isolated`].
    #[default]
    Serialized,
    /// The propagator synchronizes internally; no lock is taken.
    ThreadSafe,
}

/// Performs the computation for work units.
///
/// # Contract
///
/// - `propagate()` resolves each unit it is given with
///   [`WorkUnit::complete`] or [`WorkUnit::fail`]. Returning `Err` fails
///   every unit in the call that is still unresolved; returning `Ok` with
///   a unit left unresolved fails that unit.
/// - Results must not depend on the order in which units are propagated.
/// - The three methods are only called by a work manager and never
///   concurrently with each other for the same iteration.
/// - In a process pool each worker process owns its own instance, built
///   once at process start; only the master's instance receives the
///   iteration hooks.
///
/// # Examples
///
/// ```
/// use ensemble_core::{Batch, IterationId, PropagateContext, Propagator, PropagatorError, WorkUnit};
///
/// struct Square;
///
/// impl Propagator for Square {
///     type Input = u64;
///     type Output = u64;
///
///     fn name(&self) -> &str { "square" }
///
///     fn propagate(
///         &self,
///         units: &mut [WorkUnit<u64, u64>],
///         _ctx: &PropagateContext<'_>,
///     ) -> Result<(), PropagatorError> {
///         for unit in units {
///             let x = *unit.input();
///             unit.complete(x * x);
///         }
///         Ok(())
///     }
/// }
///
/// let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), [3, 4]);
/// let ctx = PropagateContext::unlocked(IterationId(1), None);
/// Square.propagate(batch.units_mut(), &ctx).unwrap();
/// assert_eq!(batch.units()[1].result(), Some(&16));
/// ```
pub trait Propagator: Send + Sync + 'static {
    /// Input payload carried by each unit.
    type Input: WirePayload;
    /// Result payload attached to each completed unit.
    type Output: WirePayload;

    /// Human-readable name for logs and error reports.
    fn name(&self) -> &str;

    /// Thread-safety declaration. Default: [`Concurrency::Serialized`].
    fn concurrency(&self) -> Concurrency {
        Concurrency::Serialized
    }

    /// Called once per iteration before any unit of `units` is dispatched.
    ///
    /// Default: no-op.
    fn prepare_iteration(
        &self,
        iteration: IterationId,
        units: &[WorkUnit<Self::Input, Self::Output>],
    ) -> Result<(), PropagatorError> {
        let _ = (iteration, units);
        Ok(())
    }

    /// Propagate `units`, resolving each one.
    fn propagate(
        &self,
        units: &mut [WorkUnit<Self::Input, Self::Output>],
        ctx: &PropagateContext<'_>,
    ) -> Result<(), PropagatorError>;

    /// Called once per iteration after the whole batch has resolved.
    ///
    /// Default: no-op.
    fn finalize_iteration(
        &self,
        iteration: IterationId,
        units: &[WorkUnit<Self::Input, Self::Output>],
    ) -> Result<(), PropagatorError> {
        let _ = (iteration, units);
        Ok(())
    }
}
