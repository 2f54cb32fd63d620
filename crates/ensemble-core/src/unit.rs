//! [`WorkUnit`] and [`Batch`]: the values that flow through a work manager.
//!
//! A unit is created `Pending` by the driver, moved to `Running` by the
//! backend that executes it, and resolved to `Complete` (with a result)
//! or `Failed` (with a [`UnitFailure`]) exactly once per batch. Inputs are
//! held behind an `Arc` so a backend can keep a cheap handle to a unit it
//! has handed to another thread.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::id::{IterationId, WorkUnitId};

/// Lifecycle status of a [`WorkUnit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    /// Submitted, not yet picked up by a worker.
    Pending,
    /// Held by exactly one worker.
    Running,
    /// Finished with a result.
    Complete,
    /// Finished without a result; see [`WorkUnit::failure`].
    Failed,
}

impl UnitStatus {
    /// `true` for `Complete` and `Failed`.
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a unit ended `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCause {
    /// The propagator returned an error, panicked, or left the unit
    /// unresolved.
    Propagator,
    /// The worker process holding the unit died or went silent, and the
    /// retry budget is spent.
    WorkerLost,
    /// Shutdown was requested before the unit could finish.
    Cancelled,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Propagator => "propagator failure",
            Self::WorkerLost => "worker lost",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure record attached to a `Failed` unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    /// Failure category.
    pub cause: FailureCause,
    /// Human-readable description.
    pub reason: String,
}

impl UnitFailure {
    /// Build a failure record.
    pub fn new(cause: FailureCause, reason: impl Into<String>) -> Self {
        Self {
            cause,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.cause, self.reason)
    }
}

/// One trial to propagate and, once resolved, its outcome.
///
/// `I` is the input payload produced when the driver prepared the
/// iteration; `O` is the result payload the propagator attaches.
#[derive(Debug)]
pub struct WorkUnit<I, O> {
    id: WorkUnitId,
    iteration: IterationId,
    input: Arc<I>,
    status: UnitStatus,
    result: Option<O>,
    failure: Option<UnitFailure>,
    attempts: u32,
}

impl<I, O> WorkUnit<I, O> {
    /// Create a `Pending` unit.
    pub fn new(id: WorkUnitId, iteration: IterationId, input: I) -> Self {
        Self::from_shared(id, iteration, Arc::new(input))
    }

    /// Create a `Pending` unit around an already shared input.
    pub fn from_shared(id: WorkUnitId, iteration: IterationId, input: Arc<I>) -> Self {
        Self {
            id,
            iteration,
            input,
            status: UnitStatus::Pending,
            result: None,
            failure: None,
            attempts: 0,
        }
    }

    /// Unit id, unique within its iteration.
    pub fn id(&self) -> WorkUnitId {
        self.id
    }

    /// Iteration this unit belongs to.
    pub fn iteration(&self) -> IterationId {
        self.iteration
    }

    /// Input payload.
    pub fn input(&self) -> &I {
        &self.input
    }

    /// Shared handle to the input payload.
    pub fn shared_input(&self) -> &Arc<I> {
        &self.input
    }

    /// Current status.
    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// Result payload, set once the unit is `Complete`.
    pub fn result(&self) -> Option<&O> {
        self.result.as_ref()
    }

    /// Move the result payload out, leaving `None`.
    pub fn take_result(&mut self) -> Option<O> {
        self.result.take()
    }

    /// Failure record, set once the unit is `Failed`.
    pub fn failure(&self) -> Option<&UnitFailure> {
        self.failure.as_ref()
    }

    /// Number of times a worker started executing this unit.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// `true` once the unit is `Complete` or `Failed`.
    pub fn is_resolved(&self) -> bool {
        self.status.is_resolved()
    }

    /// Resolve the unit with a result.
    pub fn complete(&mut self, output: O) {
        self.result = Some(output);
        self.failure = None;
        self.status = UnitStatus::Complete;
    }

    /// Resolve the unit as failed.
    pub fn fail(&mut self, failure: UnitFailure) {
        self.result = None;
        self.failure = Some(failure);
        self.status = UnitStatus::Failed;
    }

    /// Resolve the unit as failed with the given cause and reason.
    pub fn fail_with(&mut self, cause: FailureCause, reason: impl Into<String>) {
        self.fail(UnitFailure::new(cause, reason));
    }

    /// Mark the unit as picked up by a worker. Called by backends.
    pub fn begin(&mut self) {
        self.status = UnitStatus::Running;
        self.attempts += 1;
    }

    /// Return a `Running` unit to `Pending` so it can be retried. Called
    /// by backends after losing the worker that held it.
    pub fn requeue(&mut self) {
        self.status = UnitStatus::Pending;
        self.result = None;
    }

    /// Restore the attempt count carried over from an earlier copy of
    /// this unit. Called by backends that execute a detached copy.
    pub fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
    }

    /// A `Pending` copy sharing this unit's id, iteration, input, and
    /// attempt count, with no result.
    pub fn detached(&self) -> Self {
        let mut copy = Self::from_shared(self.id, self.iteration, Arc::clone(&self.input));
        copy.attempts = self.attempts;
        copy
    }
}

impl<I, O: Clone> Clone for WorkUnit<I, O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            iteration: self.iteration,
            input: Arc::clone(&self.input),
            status: self.status,
            result: self.result.clone(),
            failure: self.failure.clone(),
            attempts: self.attempts,
        }
    }
}

/// An ordered set of units submitted together to one `propagate` call.
///
/// Ids are unique within a batch. Backends resolve units in place, so the
/// batch handed back keeps the submission order and exactly the ids that
/// were submitted.
#[derive(Debug)]
pub struct Batch<I, O> {
    units: Vec<WorkUnit<I, O>>,
}

impl<I, O> Batch<I, O> {
    /// Build a batch, rejecting duplicate ids.
    pub fn new(units: Vec<WorkUnit<I, O>>) -> Result<Self, BatchError> {
        let mut seen = HashSet::with_capacity(units.len());
        for unit in &units {
            if !seen.insert(unit.id()) {
                return Err(BatchError::DuplicateId { id: unit.id() });
            }
        }
        Ok(Self { units })
    }

    /// Build a batch for `iteration`, numbering units `0..n` in input order.
    pub fn from_inputs(iteration: IterationId, inputs: impl IntoIterator<Item = I>) -> Self {
        let units = inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| WorkUnit::new(WorkUnitId(i as u64), iteration, input))
            .collect();
        Self { units }
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// `true` if the batch holds no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units in submission order.
    pub fn units(&self) -> &[WorkUnit<I, O>] {
        &self.units
    }

    /// Mutable access to the units for backends resolving them in place.
    ///
    /// A slice rather than the `Vec`, so units can be resolved but not
    /// added or removed.
    pub fn units_mut(&mut self) -> &mut [WorkUnit<I, O>] {
        &mut self.units
    }

    /// Iterate units in submission order.
    pub fn iter(&self) -> std::slice::Iter<'_, WorkUnit<I, O>> {
        self.units.iter()
    }

    /// Ids in submission order.
    pub fn ids(&self) -> Vec<WorkUnitId> {
        self.units.iter().map(WorkUnit::id).collect()
    }

    /// Look up a unit by id.
    pub fn get(&self, id: WorkUnitId) -> Option<&WorkUnit<I, O>> {
        self.units.iter().find(|u| u.id() == id)
    }

    /// Units that ended `Failed`.
    pub fn failed(&self) -> impl Iterator<Item = &WorkUnit<I, O>> {
        self.units
            .iter()
            .filter(|u| u.status() == UnitStatus::Failed)
    }

    /// `true` if every unit is `Complete` or `Failed`.
    pub fn is_resolved(&self) -> bool {
        self.units.iter().all(WorkUnit::is_resolved)
    }

    /// Consume the batch, returning its units.
    pub fn into_units(self) -> Vec<WorkUnit<I, O>> {
        self.units
    }
}

impl<I, O> IntoIterator for Batch<I, O> {
    type Item = WorkUnit<I, O>;
    type IntoIter = std::vec::IntoIter<WorkUnit<I, O>>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.into_iter()
    }
}

impl<'a, I, O> IntoIterator for &'a Batch<I, O> {
    type Item = &'a WorkUnit<I, O>;
    type IntoIter = std::slice::Iter<'a, WorkUnit<I, O>>;

    fn into_iter(self) -> Self::IntoIter {
        self.units.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Unit = WorkUnit<u32, u64>;

    #[test]
    fn new_unit_is_pending_without_result() {
        let u = Unit::new(WorkUnitId(1), IterationId(3), 7);
        assert_eq!(u.status(), UnitStatus::Pending);
        assert_eq!(*u.input(), 7);
        assert!(u.result().is_none());
        assert!(u.failure().is_none());
        assert_eq!(u.attempts(), 0);
    }

    #[test]
    fn complete_clears_failure() {
        let mut u = Unit::new(WorkUnitId(1), IterationId(1), 7);
        u.begin();
        u.fail_with(FailureCause::WorkerLost, "worker 0 exited");
        u.requeue();
        u.begin();
        u.complete(49);
        assert_eq!(u.status(), UnitStatus::Complete);
        assert_eq!(u.result(), Some(&49));
        assert!(u.failure().is_none());
        assert_eq!(u.attempts(), 2);
    }

    #[test]
    fn detached_copy_shares_input_and_attempts() {
        let mut u = Unit::new(WorkUnitId(4), IterationId(2), 11);
        u.begin();
        let copy = u.detached();
        assert_eq!(copy.id(), u.id());
        assert_eq!(copy.status(), UnitStatus::Pending);
        assert_eq!(copy.attempts(), 1);
        assert!(Arc::ptr_eq(copy.shared_input(), u.shared_input()));
    }

    #[test]
    fn batch_rejects_duplicate_ids() {
        let units = vec![
            Unit::new(WorkUnitId(0), IterationId(1), 1),
            Unit::new(WorkUnitId(0), IterationId(1), 2),
        ];
        assert_eq!(
            Batch::new(units).unwrap_err(),
            BatchError::DuplicateId { id: WorkUnitId(0) }
        );
    }

    #[test]
    fn from_inputs_numbers_in_order() {
        let batch: Batch<u32, u64> = Batch::from_inputs(IterationId(5), [10, 20, 30]);
        assert_eq!(batch.ids(), vec![WorkUnitId(0), WorkUnitId(1), WorkUnitId(2)]);
        assert!(batch.iter().all(|u| u.iteration() == IterationId(5)));
        assert_eq!(*batch.get(WorkUnitId(2)).unwrap().input(), 30);
        assert!(!batch.is_resolved());
    }

    #[test]
    fn failed_filters_by_status() {
        let mut batch: Batch<u32, u64> = Batch::from_inputs(IterationId(1), [1, 2, 3]);
        batch.units_mut()[0].complete(1);
        batch.units_mut()[1].fail_with(FailureCause::Propagator, "boom");
        batch.units_mut()[2].complete(9);
        let failed: Vec<_> = batch.failed().map(WorkUnit::id).collect();
        assert_eq!(failed, vec![WorkUnitId(1)]);
        assert!(batch.is_resolved());
    }
}
