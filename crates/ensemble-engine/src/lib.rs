//! Work manager and execution backends for Ensemble.
//!
//! [`WorkManager`] runs the iteration lifecycle over one
//! [`ExecutionBackend`]: [`SerialBackend`] in the calling thread,
//! [`ThreadPoolBackend`] across named threads sharing one propagator, or
//! [`ProcessPoolBackend`] across dedicated worker processes that speak
//! the framed [`protocol`].

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod process_pool;
pub mod protocol;
pub mod serial;
pub mod thread_pool;
pub mod worker;

pub use backend::{ExecutionBackend, ShutdownHandle, ShutdownStats, Units};
pub use config::{
    BackendKind, ConfigError, Mode, WorkManagerConfig, WorkerCommand, HEARTBEAT_ENV,
};
pub use error::{BackendError, PropagationFailure, WorkError};
pub use manager::{ManagerState, ShutdownReport, WorkManager};
pub use process_pool::ProcessPoolBackend;
pub use protocol::{Message, ProtocolError};
pub use serial::SerialBackend;
pub use thread_pool::ThreadPoolBackend;
pub use worker::WorkerSummary;
