//! Ensemble: a work manager for iterative ensemble simulations.
//!
//! A simulation driver propagates many independent trial trajectories
//! ("work units") each iteration. This crate re-exports the pieces that
//! dispatch those units to a serial, thread-pool or process-pool backend
//! and hand the results back in submission order.
//!
//! # Quick start
//!
//! ```rust
//! use ensemble::prelude::*;
//!
//! let config = WorkManagerConfig::for_backend(BackendKind::ThreadPool);
//! let mut manager = WorkManager::new(config, RandomWalk::default()).unwrap();
//! manager.prepare().unwrap();
//!
//! let mut batch = Batch::from_inputs(IterationId(1), (0..8).map(|i| WalkInput::new(i, 20)));
//! manager.prepare_iteration(IterationId(1), &batch).unwrap();
//! manager.propagate(&mut batch).unwrap();
//! manager.finalize_iteration(IterationId(1), &batch).unwrap();
//! assert!(batch.iter().all(|u| u.result().unwrap().pcoord.len() == 21));
//!
//! let report = manager.shutdown(0);
//! assert!(report.performed_teardown);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `ensemble-core` | Ids, work units, batches, payload codec, `Propagator` |
//! | [`engine`] | `ensemble-engine` | `WorkManager`, backends, configuration, wire protocol |
//! | [`propagators`] | `ensemble-propagators` | Reference random-walk propagator |
//!
//! # Worker processes
//!
//! The process-pool backend launches a worker executable that builds its
//! own propagator and calls [`WorkManager::run_worker`](engine::WorkManager::run_worker)
//! in worker mode. The `ensemble-demo` binary shipped with this crate is
//! both a driver and such a worker.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types and traits (`ensemble-core`).
///
/// Work units and batches, identifiers, the [`types::WirePayload`] codec
/// and the [`types::Propagator`] trait.
pub use ensemble_core as types;

/// Work manager and execution backends (`ensemble-engine`).
pub use ensemble_engine as engine;

/// Reference propagators (`ensemble-propagators`).
pub use ensemble_propagators as propagators;

/// Common imports for typical driver code.
///
/// ```rust
/// use ensemble::prelude::*;
/// ```
pub mod prelude {
    // Core types and traits
    pub use ensemble_core::{
        Batch, Concurrency, FailureCause, IterationId, PropagateContext, Propagator,
        UnitFailure, UnitStatus, WirePayload, WorkUnit, WorkUnitId,
    };

    // Errors
    pub use ensemble_core::PropagatorError;
    pub use ensemble_engine::{ConfigError, PropagationFailure, WorkError};

    // Engine
    pub use ensemble_engine::{
        BackendKind, ManagerState, Mode, ShutdownHandle, ShutdownReport, WorkManager,
        WorkManagerConfig, WorkerCommand,
    };

    // Reference propagator
    pub use ensemble_propagators::{Fault, RandomWalk, WalkInput, WalkOutput};
}
