//! Seeded one-dimensional random walk.
//!
//! Each unit walks `steps` steps from `start`, drawing uniform steps in
//! `[-step_size, step_size]` plus a constant drift, and returns the full
//! progress-coordinate trace (`steps + 1` points, start and end
//! included). The RNG is a ChaCha8 stream seeded from the unit's own
//! `seed`, so a unit produces the same trace on every backend and on
//! every retry.
//!
//! Units can also carry a [`Fault`] to exercise the work manager's
//! failure paths. `Crash` and `CrashOnce` abort the whole process, so
//! they only make sense on the process pool.
//!
//! Constructed via the builder pattern: [`RandomWalk::builder`].

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use ensemble_core::{
    Concurrency, FailureCause, PropagateContext, Propagator, PropagatorError, WorkUnit,
};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fault to inject while propagating a unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fault {
    /// Walk normally.
    #[default]
    None,
    /// Fail the unit with a propagator error.
    Fail,
    /// Panic inside `propagate`.
    Panic,
    /// Abort the process.
    Crash,
    /// Abort the process the first time, walk normally afterwards.
    /// The first attempt creates `marker`; later attempts find it.
    CrashOnce {
        /// File whose existence records the first crash.
        marker: PathBuf,
    },
    /// Never return.
    Hang,
}

/// Input of one walker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkInput {
    /// RNG seed.
    pub seed: u64,
    /// Initial progress coordinate.
    pub start: f64,
    /// Number of steps.
    pub steps: u32,
    /// Largest absolute random step.
    pub step_size: f64,
    /// Extra wall-clock time per unit, spent with the propagation lock
    /// released.
    pub delay_ms: u64,
    /// Fault to inject.
    pub fault: Fault,
}

impl Default for WalkInput {
    fn default() -> Self {
        Self {
            seed: 0,
            start: 0.0,
            steps: 10,
            step_size: 1.0,
            delay_ms: 0,
            fault: Fault::None,
        }
    }
}

impl WalkInput {
    /// A fault-free walker with the given seed and step count.
    pub fn new(seed: u64, steps: u32) -> Self {
        Self {
            seed,
            steps,
            ..Self::default()
        }
    }

    /// Start from `start` instead of 0.
    pub fn starting_at(mut self, start: f64) -> Self {
        self.start = start;
        self
    }

    /// Spend `delay` per unit.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    /// Inject `fault`.
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }
}

/// Output of one walker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalkOutput {
    /// Progress coordinate after each step, starting with the initial
    /// value.
    pub pcoord: Vec<f64>,
}

impl WalkOutput {
    /// Final progress coordinate.
    pub fn last(&self) -> Option<f64> {
        self.pcoord.last().copied()
    }
}

/// A deterministic random-walk propagator.
///
/// Stateless apart from a call counter, so it declares
/// [`Concurrency::ThreadSafe`].
#[derive(Debug)]
pub struct RandomWalk {
    drift: f64,
    bounds: Option<(f64, f64)>,
    propagated: AtomicU64,
}

/// Builder for [`RandomWalk`].
pub struct RandomWalkBuilder {
    drift: f64,
    bounds: Option<(f64, f64)>,
}

impl RandomWalk {
    /// Create a new builder.
    pub fn builder() -> RandomWalkBuilder {
        RandomWalkBuilder {
            drift: 0.0,
            bounds: None,
        }
    }

    /// Units propagated by this instance so far.
    pub fn propagated(&self) -> u64 {
        self.propagated.load(Ordering::Relaxed)
    }

    /// Walk `input` and return its trace.
    pub fn walk(&self, input: &WalkInput) -> WalkOutput {
        let mut rng = ChaCha8Rng::seed_from_u64(input.seed);
        let mut x = input.start;
        let mut pcoord = Vec::with_capacity(input.steps as usize + 1);
        pcoord.push(x);
        for _ in 0..input.steps {
            let u: f64 = rng.random();
            x += self.drift + input.step_size * (2.0 * u - 1.0);
            if let Some((lo, hi)) = self.bounds {
                x = reflect(x, lo, hi);
            }
            pcoord.push(x);
        }
        WalkOutput { pcoord }
    }
}

impl Default for RandomWalk {
    fn default() -> Self {
        Self {
            drift: 0.0,
            bounds: None,
            propagated: AtomicU64::new(0),
        }
    }
}

impl RandomWalkBuilder {
    /// Constant added to every step (default: 0).
    pub fn drift(mut self, drift: f64) -> Self {
        self.drift = drift;
        self
    }

    /// Reflect the walker off `lo` and `hi` (default: unbounded).
    pub fn bounds(mut self, lo: f64, hi: f64) -> Self {
        self.bounds = Some((lo, hi));
        self
    }

    /// Build the propagator.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `drift` is not finite or the bounds are not a
    /// finite, non-empty interval.
    pub fn build(self) -> Result<RandomWalk, String> {
        if !self.drift.is_finite() {
            return Err(format!("drift must be finite, got {}", self.drift));
        }
        if let Some((lo, hi)) = self.bounds {
            if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                return Err(format!("bounds must satisfy lo < hi, got [{lo}, {hi}]"));
            }
        }
        Ok(RandomWalk {
            drift: self.drift,
            bounds: self.bounds,
            propagated: AtomicU64::new(0),
        })
    }
}

impl Propagator for RandomWalk {
    type Input = WalkInput;
    type Output = WalkOutput;

    fn name(&self) -> &str {
        "RandomWalk"
    }

    fn concurrency(&self) -> Concurrency {
        Concurrency::ThreadSafe
    }

    fn propagate(
        &self,
        units: &mut [WorkUnit<WalkInput, WalkOutput>],
        ctx: &PropagateContext<'_>,
    ) -> Result<(), PropagatorError> {
        for unit in units {
            let WalkInput {
                delay_ms, fault, ..
            } = unit.input().clone();
            if delay_ms > 0 {
                ctx.isolated(|| thread::sleep(Duration::from_millis(delay_ms)));
            }

            match &fault {
                Fault::None => {}
                Fault::Fail => {
                    unit.fail_with(FailureCause::Propagator, "injected failure");
                    continue;
                }
                Fault::Panic => panic!("injected panic in unit {}", unit.id()),
                Fault::Crash => crash(unit.id()),
                Fault::CrashOnce { marker } => match first_attempt(marker) {
                    Ok(true) => crash(unit.id()),
                    Ok(false) => debug!(unit = %unit.id(), "crash marker present; walking"),
                    Err(e) => {
                        let reason = format!("crash marker {}: {e}", marker.display());
                        unit.fail_with(FailureCause::Propagator, reason);
                        continue;
                    }
                },
                Fault::Hang => ctx.isolated(|| loop {
                    thread::sleep(Duration::from_secs(3600));
                }),
            }

            let output = self.walk(unit.input());
            unit.complete(output);
            self.propagated.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Reflect `x` into `[lo, hi]`.
fn reflect(mut x: f64, lo: f64, hi: f64) -> f64 {
    let width = hi - lo;
    // Bounded loop: a step larger than the interval folds at most a few times.
    for _ in 0..64 {
        if x < lo {
            x = lo + (lo - x);
        } else if x > hi {
            x = hi - (x - hi);
        } else {
            return x;
        }
    }
    lo + (x - lo).rem_euclid(width)
}

/// Create `marker` if it does not exist yet. `Ok(true)` means this call
/// created it.
fn first_attempt(marker: &Path) -> io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(marker) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

fn crash(unit: ensemble_core::WorkUnitId) -> ! {
    warn!(unit = %unit, pid = process::id(), "injected crash");
    process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::{Batch, IterationId, UnitStatus};

    fn run(walk: &RandomWalk, inputs: Vec<WalkInput>) -> Batch<WalkInput, WalkOutput> {
        let mut batch = Batch::from_inputs(IterationId(1), inputs);
        let ctx = PropagateContext::unlocked(IterationId(1), None);
        walk.propagate(batch.units_mut(), &ctx).unwrap();
        batch
    }

    #[test]
    fn trace_includes_start_and_every_step() {
        let walk = RandomWalk::default();
        let out = walk.walk(&WalkInput::new(7, 25).starting_at(3.0));
        assert_eq!(out.pcoord.len(), 26);
        assert_eq!(out.pcoord[0], 3.0);
        for pair in out.pcoord.windows(2) {
            assert!((pair[1] - pair[0]).abs() <= 1.0);
        }
    }

    #[test]
    fn same_seed_same_trace() {
        let walk = RandomWalk::default();
        let a = walk.walk(&WalkInput::new(42, 100));
        let b = walk.walk(&WalkInput::new(42, 100));
        let c = walk.walk(&WalkInput::new(43, 100));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn drift_moves_the_mean() {
        let walk = RandomWalk::builder().drift(0.5).build().unwrap();
        let end = walk.walk(&WalkInput::new(1, 200)).last().unwrap();
        assert!(end > 50.0, "end = {end}");
    }

    #[test]
    fn bounds_are_respected() {
        let walk = RandomWalk::builder().bounds(-1.0, 1.0).build().unwrap();
        let mut input = WalkInput::new(9, 500);
        input.step_size = 5.0;
        let out = walk.walk(&input);
        assert!(out.pcoord.iter().all(|x| (-1.0..=1.0).contains(x)));
    }

    #[test]
    fn builder_rejects_bad_configuration() {
        assert!(RandomWalk::builder().drift(f64::NAN).build().is_err());
        assert!(RandomWalk::builder().bounds(1.0, 1.0).build().is_err());
        assert!(RandomWalk::builder().bounds(0.0, f64::INFINITY).build().is_err());
    }

    #[test]
    fn fail_fault_fails_only_that_unit() {
        let walk = RandomWalk::default();
        let batch = run(
            &walk,
            vec![
                WalkInput::new(1, 5),
                WalkInput::new(2, 5).with_fault(Fault::Fail),
                WalkInput::new(3, 5),
            ],
        );
        let statuses: Vec<_> = batch.iter().map(|u| u.status()).collect();
        assert_eq!(
            statuses,
            vec![UnitStatus::Complete, UnitStatus::Failed, UnitStatus::Complete]
        );
        assert_eq!(walk.propagated(), 2);
    }

    #[test]
    fn crash_once_walks_when_marker_exists() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("crashed");
        std::fs::write(&marker, b"").unwrap();
        let walk = RandomWalk::default();
        let batch = run(
            &walk,
            vec![WalkInput::new(5, 4).with_fault(Fault::CrashOnce { marker })],
        );
        assert_eq!(batch.units()[0].result(), Some(&walk.walk(&WalkInput::new(5, 4))));
    }

    #[test]
    fn first_attempt_creates_marker_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("m");
        assert!(first_attempt(&marker).unwrap());
        assert!(!first_attempt(&marker).unwrap());
        assert!(first_attempt(&dir.path().join("missing/m")).is_err());
    }

    #[test]
    fn delay_is_spent_outside_the_lock() {
        let lock = std::sync::Mutex::new(());
        let ctx = PropagateContext::locked(IterationId(1), None, &lock);
        let walk = RandomWalk::default();
        let mut batch = Batch::from_inputs(
            IterationId(1),
            [WalkInput::new(1, 1).with_delay(Duration::from_millis(20))],
        );
        walk.propagate(batch.units_mut(), &ctx).unwrap();
        assert!(ctx.holds_lock());
        assert!(batch.is_resolved());
    }

    #[test]
    fn input_survives_the_wire() {
        use ensemble_core::WirePayload;
        let input = WalkInput::new(3, 8).with_fault(Fault::CrashOnce {
            marker: PathBuf::from("/tmp/x"),
        });
        assert_eq!(WalkInput::from_bytes(&input.to_bytes().unwrap()).unwrap(), input);
    }
}
