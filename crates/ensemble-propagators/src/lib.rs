//! Reference propagators for the Ensemble work manager.
//!
//! [`RandomWalk`] is a deterministic, seeded walker whose inputs can
//! carry injected faults. It is the propagator behind the
//! `ensemble-demo` binary and the process-pool integration tests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod random_walk;

pub use random_walk::{Fault, RandomWalk, RandomWalkBuilder, WalkInput, WalkOutput};
