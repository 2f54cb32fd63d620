//! Test utilities for Ensemble development.
//!
//! Deterministic `u64 → u64` propagators for exercising backends and the
//! work manager: see [`fixtures`].

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

pub use fixtures::{
    FailingPropagator, IsolatingPropagator, PanickingPropagator, RecordingPropagator,
    SleepPropagator, SquarePropagator,
};
