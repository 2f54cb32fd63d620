//! Work manager error taxonomy.
//!
//! Lifecycle and configuration errors are fatal and reported immediately.
//! Unit failures are collected per batch and reported once, as a single
//! [`PropagationFailure`], after every unit has resolved.

use std::fmt;
use std::io;

use ensemble_core::{
    FailureCause, IterationId, PropagatorError, UnitFailure, WorkUnitId, WorkerId,
};
use thiserror::Error;

use crate::config::{BackendKind, ConfigError};
use crate::manager::ManagerState;
use crate::protocol::ProtocolError;

// ── PropagationFailure ─────────────────────────────────────────────

/// Aggregate report of the units that failed in one `propagate` call.
///
/// The batch itself, failed units included, stays with the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropagationFailure {
    /// Iteration the batch belonged to.
    pub iteration: IterationId,
    /// Number of units in the batch.
    pub total: usize,
    /// Every failed unit, in submission order.
    pub failures: Vec<(WorkUnitId, UnitFailure)>,
}

impl PropagationFailure {
    /// Ids of the failed units, in submission order.
    pub fn failed_ids(&self) -> Vec<WorkUnitId> {
        self.failures.iter().map(|(id, _)| *id).collect()
    }

    /// Number of failures with the given cause.
    pub fn count(&self, cause: FailureCause) -> usize {
        self.failures
            .iter()
            .filter(|(_, failure)| failure.cause == cause)
            .count()
    }

    /// Failure record for `id`, if that unit failed.
    pub fn failure_of(&self, id: WorkUnitId) -> Option<&UnitFailure> {
        self.failures
            .iter()
            .find(|(unit, _)| *unit == id)
            .map(|(_, failure)| failure)
    }
}

impl fmt::Display for PropagationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} units failed in iteration {}",
            self.failures.len(),
            self.total,
            self.iteration
        )?;
        if let Some((id, failure)) = self.failures.first() {
            write!(f, " (first: unit {id}, {failure})")?;
        }
        Ok(())
    }
}

impl std::error::Error for PropagationFailure {}

// ── BackendError ───────────────────────────────────────────────────

/// Failures while acquiring or talking to backend resources.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A worker process could not be launched.
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        /// Slot of the worker.
        worker: WorkerId,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// A pool thread could not be started.
    #[error("thread spawn failed: {reason}")]
    ThreadSpawnFailed {
        /// Which thread failed, and why.
        reason: String,
    },
    /// `propagate` was called on a backend whose `prepare` never ran.
    #[error("backend used before prepare()")]
    NotPrepared,
    /// Every pool thread has exited.
    #[error("all pool threads have exited")]
    PoolDisconnected,
    /// I/O failure on a worker channel.
    #[error("worker channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

// ── WorkError ──────────────────────────────────────────────────────

/// Errors returned by [`WorkManager`](crate::manager::WorkManager) operations.
#[derive(Debug, Error)]
pub enum WorkError {
    /// Invalid configuration, or an input that cannot be dispatched.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    /// The operation is not legal in the manager's current state.
    #[error("{operation} is not valid in state {state}: {detail}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the manager was in.
        state: ManagerState,
        /// What was wrong.
        detail: String,
    },
    /// The backend does not implement the operation.
    #[error("{operation} is not supported by the {backend} backend")]
    UnsupportedOperation {
        /// Operation that was attempted.
        operation: &'static str,
        /// Backend that refused it.
        backend: BackendKind,
    },
    /// `prepare_with` was called with a different backend configuration
    /// after the backend had already been prepared.
    #[error("backend already prepared with a different configuration")]
    AlreadyPrepared,
    /// One or more units failed; every other unit still resolved.
    #[error("propagation failed: {0}")]
    Propagation(#[from] PropagationFailure),
    /// A propagator iteration hook failed.
    #[error("propagator '{name}' failed in {hook}: {source}")]
    Propagator {
        /// Propagator name.
        name: String,
        /// `prepare_iteration` or `finalize_iteration`.
        hook: &'static str,
        /// The propagator's error.
        #[source]
        source: PropagatorError,
    },
    /// Spawn or I/O failure while acquiring or using backend resources.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    /// Malformed traffic on the master/worker channel.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl WorkError {
    /// The aggregate unit failure, if this is a propagation error.
    pub fn as_propagation(&self) -> Option<&PropagationFailure> {
        match self {
            Self::Propagation(failure) => Some(failure),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> PropagationFailure {
        PropagationFailure {
            iteration: IterationId(4),
            total: 4,
            failures: vec![
                (
                    WorkUnitId(1),
                    UnitFailure::new(FailureCause::Propagator, "negative weight"),
                ),
                (
                    WorkUnitId(3),
                    UnitFailure::new(FailureCause::WorkerLost, "worker 1 exited"),
                ),
            ],
        }
    }

    #[test]
    fn propagation_failure_display_names_first_unit() {
        let msg = failure().to_string();
        assert!(msg.contains("2 of 4 units failed in iteration 4"), "{msg}");
        assert!(msg.contains("unit #1"), "{msg}");
        assert!(msg.contains("negative weight"), "{msg}");
    }

    #[test]
    fn propagation_failure_queries() {
        let f = failure();
        assert_eq!(f.failed_ids(), vec![WorkUnitId(1), WorkUnitId(3)]);
        assert_eq!(f.count(FailureCause::WorkerLost), 1);
        assert_eq!(f.count(FailureCause::Cancelled), 0);
        assert_eq!(
            f.failure_of(WorkUnitId(3)).map(|u| u.cause),
            Some(FailureCause::WorkerLost)
        );
        assert!(f.failure_of(WorkUnitId(2)).is_none());
    }

    #[test]
    fn work_error_wraps_sources() {
        let err = WorkError::from(failure());
        assert!(err.as_propagation().is_some());

        let err = WorkError::from(ConfigError::PoolSizeZero);
        assert!(err.to_string().contains("pool_size"));

        let err = WorkError::Propagator {
            name: "walk".into(),
            hook: "prepare_iteration",
            source: PropagatorError::failed("no basis states"),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("execution failed: no basis states"));
    }
}
