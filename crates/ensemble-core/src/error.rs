//! Error types shared by propagators, payload codecs, and batches.
//!
//! Lifecycle and backend errors live in `ensemble-engine`; this module
//! only covers what a [`Propagator`](crate::Propagator) implementation or
//! a payload type needs to report.

use thiserror::Error;

use crate::id::WorkUnitId;

/// Errors returned by a [`Propagator`](crate::Propagator).
///
/// Returned from `propagate()` this fails every unit in the call that the
/// propagator had not already resolved. Returned from the iteration hooks
/// it is surfaced to the driver unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PropagatorError {
    /// The propagation step itself failed.
    #[error("execution failed: {reason}")]
    ExecutionFailed {
        /// Human-readable description of the failure.
        reason: String,
    },
    /// An external program the propagator delegated to failed.
    #[error("external process failed with status {status:?}: {reason}")]
    ExternalFailed {
        /// Exit status of the external program, if it exited.
        status: Option<i32>,
        /// Description of the failure.
        reason: String,
    },
    /// A work unit's input did not satisfy the propagator's expectations.
    #[error("invalid input for unit {id}: {reason}")]
    InvalidInput {
        /// The offending unit.
        id: WorkUnitId,
        /// Description of the problem.
        reason: String,
    },
}

impl PropagatorError {
    /// Shorthand for [`PropagatorError::ExecutionFailed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            reason: reason.into(),
        }
    }
}

/// Errors from encoding or decoding a [`WirePayload`](crate::WirePayload).
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The value could not be encoded to bytes.
    #[error("payload encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// The bytes could not be decoded into the expected type.
    #[error("payload decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A hand-written codec rejected the value or bytes.
    #[error("payload codec rejected value: {reason}")]
    Rejected {
        /// Description of the rejection.
        reason: String,
    },
}

/// Errors detected while assembling a [`Batch`](crate::Batch).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BatchError {
    /// Two units in the batch share an id.
    #[error("duplicate work unit id {id} in batch")]
    DuplicateId {
        /// The repeated id.
        id: WorkUnitId,
    },
}
