//! Core types and traits for the Ensemble work manager.
//!
//! This is the leaf crate of the workspace. It defines the values that
//! flow between a simulation driver and its work manager: identifiers,
//! [`WorkUnit`] and [`Batch`], the [`WirePayload`] codec that lets payloads
//! cross a process boundary, and the [`Propagator`] collaborator trait.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod context;
pub mod error;
pub mod id;
pub mod payload;
pub mod propagator;
pub mod unit;

pub use context::PropagateContext;
pub use error::{BatchError, PayloadError, PropagatorError};
pub use id::{IterationId, WorkUnitId, WorkerId};
pub use payload::WirePayload;
pub use propagator::{Concurrency, Propagator};
pub use unit::{Batch, FailureCause, UnitFailure, UnitStatus, WorkUnit};
