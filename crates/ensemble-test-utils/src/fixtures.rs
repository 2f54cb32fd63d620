//! Reusable propagator test fixtures.
//!
//! - [`SquarePropagator`] squares its input and records call order.
//! - [`FailingPropagator`] fails a chosen set of units.
//! - [`PanickingPropagator`] panics on a chosen set of units.
//! - [`SleepPropagator`] echoes its input after a delay and tracks overlap.
//! - [`IsolatingPropagator`] sleeps inside `PropagateContext::isolated`.
//! - [`RecordingPropagator`] logs every hook call.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use ensemble_core::{
    Concurrency, IterationId, PropagateContext, Propagator, PropagatorError, WorkUnit, WorkUnitId,
};

type Unit = WorkUnit<u64, u64>;

/// Tracks how many callers are inside a section at once.
#[derive(Default)]
struct OverlapGauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl OverlapGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

// ── SquarePropagator ────────────────────────────────────────────

/// Completes every unit with the square of its input.
#[derive(Default)]
pub struct SquarePropagator {
    calls: Mutex<Vec<WorkUnitId>>,
}

impl SquarePropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the units propagated so far, in call order.
    pub fn call_order(&self) -> Vec<WorkUnitId> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Propagator for SquarePropagator {
    type Input = u64;
    type Output = u64;

    fn name(&self) -> &str {
        "square"
    }

    fn propagate(&self, units: &mut [Unit], _ctx: &PropagateContext<'_>) -> Result<(), PropagatorError> {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        for unit in units {
            calls.push(unit.id());
            let x = *unit.input();
            unit.complete(x.wrapping_mul(x));
        }
        Ok(())
    }
}

// ── FailingPropagator ───────────────────────────────────────────

/// Squares every unit except the listed ones, which fail with an
/// "injected failure" error.
pub struct FailingPropagator {
    fail: HashSet<WorkUnitId>,
}

impl FailingPropagator {
    pub fn new(ids: impl IntoIterator<Item = WorkUnitId>) -> Self {
        Self {
            fail: ids.into_iter().collect(),
        }
    }
}

impl Propagator for FailingPropagator {
    type Input = u64;
    type Output = u64;

    fn name(&self) -> &str {
        "failing"
    }

    fn propagate(&self, units: &mut [Unit], _ctx: &PropagateContext<'_>) -> Result<(), PropagatorError> {
        let mut first_failed = None;
        for unit in units {
            if self.fail.contains(&unit.id()) {
                first_failed.get_or_insert(unit.id());
            } else {
                let x = *unit.input();
                unit.complete(x.wrapping_mul(x));
            }
        }
        match first_failed {
            Some(id) => Err(PropagatorError::failed(format!("injected failure for unit {id}"))),
            None => Ok(()),
        }
    }
}

// ── PanickingPropagator ─────────────────────────────────────────

/// Squares every unit except the listed ones, on which it panics.
pub struct PanickingPropagator {
    panic_on: HashSet<WorkUnitId>,
}

impl PanickingPropagator {
    pub fn new(ids: impl IntoIterator<Item = WorkUnitId>) -> Self {
        Self {
            panic_on: ids.into_iter().collect(),
        }
    }
}

impl Propagator for PanickingPropagator {
    type Input = u64;
    type Output = u64;

    fn name(&self) -> &str {
        "panicking"
    }

    fn propagate(&self, units: &mut [Unit], _ctx: &PropagateContext<'_>) -> Result<(), PropagatorError> {
        for unit in units {
            if self.panic_on.contains(&unit.id()) {
                panic!("injected panic on unit {}", unit.id());
            }
            let x = *unit.input();
            unit.complete(x.wrapping_mul(x));
        }
        Ok(())
    }
}

// ── SleepPropagator ─────────────────────────────────────────────

/// Sleeps for a fixed delay per unit, then echoes the input.
///
/// The sleep happens with the propagation lock held (if any), so a
/// serialized instance never overlaps in a thread pool.
pub struct SleepPropagator {
    delay: Duration,
    concurrency: Concurrency,
    gauge: OverlapGauge,
}

impl SleepPropagator {
    /// Declares [`Concurrency::Serialized`].
    pub fn serialized(delay: Duration) -> Self {
        Self::with_concurrency(delay, Concurrency::Serialized)
    }

    /// Declares [`Concurrency::ThreadSafe`].
    pub fn thread_safe(delay: Duration) -> Self {
        Self::with_concurrency(delay, Concurrency::ThreadSafe)
    }

    fn with_concurrency(delay: Duration, concurrency: Concurrency) -> Self {
        Self {
            delay,
            concurrency,
            gauge: OverlapGauge::default(),
        }
    }

    /// Most calls observed in progress at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.gauge.max()
    }
}

impl Propagator for SleepPropagator {
    type Input = u64;
    type Output = u64;

    fn name(&self) -> &str {
        "sleep"
    }

    fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    fn propagate(&self, units: &mut [Unit], _ctx: &PropagateContext<'_>) -> Result<(), PropagatorError> {
        self.gauge.enter();
        for unit in units.iter_mut() {
            thread::sleep(self.delay);
            let x = *unit.input();
            unit.complete(x);
        }
        self.gauge.exit();
        Ok(())
    }
}

// ── IsolatingPropagator ─────────────────────────────────────────

/// Serialized propagator that does its waiting inside
/// [`PropagateContext::isolated`], like one driving an external program.
pub struct IsolatingPropagator {
    delay: Duration,
    gauge: OverlapGauge,
}

impl IsolatingPropagator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            gauge: OverlapGauge::default(),
        }
    }

    /// Most isolated sections observed in progress at the same time.
    pub fn max_isolated_overlap(&self) -> usize {
        self.gauge.max()
    }
}

impl Propagator for IsolatingPropagator {
    type Input = u64;
    type Output = u64;

    fn name(&self) -> &str {
        "isolating"
    }

    fn propagate(&self, units: &mut [Unit], ctx: &PropagateContext<'_>) -> Result<(), PropagatorError> {
        for unit in units {
            ctx.isolated(|| {
                self.gauge.enter();
                thread::sleep(self.delay);
                self.gauge.exit();
            });
            let x = *unit.input();
            unit.complete(x + 1);
        }
        Ok(())
    }
}

// ── RecordingPropagator ─────────────────────────────────────────

/// Squares its input and records every hook call as a string such as
/// `"prepare_iteration 3"` or `"propagate #0"`.
#[derive(Default)]
pub struct RecordingPropagator {
    events: Mutex<Vec<String>>,
}

impl RecordingPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, event: String) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl Propagator for RecordingPropagator {
    type Input = u64;
    type Output = u64;

    fn name(&self) -> &str {
        "recording"
    }

    fn prepare_iteration(&self, iteration: IterationId, _units: &[Unit]) -> Result<(), PropagatorError> {
        self.record(format!("prepare_iteration {iteration}"));
        Ok(())
    }

    fn propagate(&self, units: &mut [Unit], _ctx: &PropagateContext<'_>) -> Result<(), PropagatorError> {
        for unit in units {
            self.record(format!("propagate {}", unit.id()));
            let x = *unit.input();
            unit.complete(x.wrapping_mul(x));
        }
        Ok(())
    }

    fn finalize_iteration(&self, iteration: IterationId, _units: &[Unit]) -> Result<(), PropagatorError> {
        self.record(format!("finalize_iteration {iteration}"));
        Ok(())
    }
}
