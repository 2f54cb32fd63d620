//! The work manager: iteration lifecycle over one execution backend.
//!
//! [`WorkManager`] is the driver-facing API. It owns exactly one
//! [`ExecutionBackend`], shares the bound [`Propagator`] with it, and
//! enforces the iteration state machine:
//!
//! ```text
//! Uninitialized ─prepare─▶ Prepared ─prepare_iteration─▶ IterationActive
//!                             ▲                               │
//!                             └──────finalize_iteration───────┘
//!                  shutdown (from any state) ─▶ ShuttingDown ─▶ Terminated
//! ```
//!
//! # Shutdown during a batch
//!
//! [`propagate`](WorkManager::propagate) holds the manager exclusively, so
//! a shutdown from another thread (a signal handler, a watchdog) goes
//! through a [`ShutdownHandle`] taken from
//! [`shutdown_handle`](WorkManager::shutdown_handle). The running batch
//! stops dispatching, waits out the grace period, and returns; the
//! manager is then `ShuttingDown` and the driver's
//! [`shutdown`](WorkManager::shutdown) call finishes teardown.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ensemble_core::{Batch, FailureCause, IterationId, Propagator};
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionBackend, ShutdownHandle};
use crate::config::{BackendKind, ConfigError, Mode, WorkManagerConfig};
use crate::error::{PropagationFailure, WorkError};
use crate::process_pool::ProcessPoolBackend;
use crate::serial::SerialBackend;
use crate::thread_pool::ThreadPoolBackend;

// Compile-time assertion: a manager can be moved to another thread.
const _: () = {
    #[allow(dead_code)]
    fn assert_send<T: Send>() {}
    #[allow(dead_code)]
    fn check<P: Propagator>() {
        assert_send::<WorkManager<P>>();
    }
};

// ── ManagerState ────────────────────────────────────────────────

/// Lifecycle state of a [`WorkManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagerState {
    /// Constructed; backend resources not yet acquired.
    Uninitialized,
    /// Ready for `prepare_iteration`.
    Prepared,
    /// Between `prepare_iteration` and `finalize_iteration`.
    IterationActive,
    /// Shutdown requested or in progress.
    ShuttingDown,
    /// Backend resources released. Only `shutdown` remains callable.
    Terminated,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Prepared => "prepared",
            Self::IterationActive => "iteration-active",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        })
    }
}

// ── ShutdownReport ──────────────────────────────────────────────

/// Outcome of [`WorkManager::shutdown`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Exit code the driver should exit with. The first code requested,
    /// through the handle or through `shutdown`, wins.
    pub exit_code: i32,
    /// Time spent in teardown.
    pub elapsed: Duration,
    /// Workers that stopped within the grace period.
    pub workers_joined: usize,
    /// Pool threads left detached after the grace period.
    pub workers_abandoned: usize,
    /// Worker processes killed after the grace period.
    pub workers_killed: usize,
    /// `true` for the call that actually tore the backend down, `false`
    /// for every later call.
    pub performed_teardown: bool,
}

// ── WorkManager ─────────────────────────────────────────────────

/// Dispatches batches of work units to an execution backend, one
/// iteration at a time.
///
/// # Example
///
/// ```ignore
/// let mut manager = WorkManager::new(WorkManagerConfig::for_backend(BackendKind::ThreadPool), walk)?;
/// manager.prepare()?;
/// for n in 1..=iterations {
///     let mut batch = Batch::from_inputs(IterationId(n), inputs(n));
///     manager.prepare_iteration(IterationId(n), &batch)?;
///     manager.propagate(&mut batch)?;
///     manager.finalize_iteration(IterationId(n), &batch)?;
/// }
/// let report = manager.shutdown(0);
/// ```
pub struct WorkManager<P: Propagator> {
    config: WorkManagerConfig,
    propagator: Arc<P>,
    backend: Box<dyn ExecutionBackend<P>>,
    state: ManagerState,
    last_iteration: Option<IterationId>,
    active_iteration: Option<IterationId>,
    signal: ShutdownHandle,
    report: Option<ShutdownReport>,
}

impl<P: Propagator> WorkManager<P> {
    /// Create a manager for `config`, choosing the backend from
    /// `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkError::Configuration`] if `config` fails
    /// [`validate`](WorkManagerConfig::validate).
    pub fn new(config: WorkManagerConfig, propagator: P) -> Result<Self, WorkError> {
        Self::with_shared(config, Arc::new(propagator))
    }

    /// Like [`new`](Self::new) for a propagator the caller also keeps.
    pub fn with_shared(config: WorkManagerConfig, propagator: Arc<P>) -> Result<Self, WorkError> {
        let backend: Box<dyn ExecutionBackend<P>> = match config.backend {
            BackendKind::Serial => Box::new(SerialBackend::<P>::new()),
            BackendKind::ThreadPool => Box::new(ThreadPoolBackend::<P>::new()),
            BackendKind::ProcessPool => Box::new(ProcessPoolBackend::<P>::new()),
        };
        Self::with_backend(config, propagator, backend)
    }

    /// Create a manager around a caller-supplied backend.
    ///
    /// `config.backend` is ignored in favour of `backend.kind()`.
    pub fn with_backend(
        mut config: WorkManagerConfig,
        propagator: Arc<P>,
        backend: Box<dyn ExecutionBackend<P>>,
    ) -> Result<Self, WorkError> {
        config.backend = backend.kind();
        config.validate()?;
        debug!(
            mode = %config.mode,
            backend = %config.backend,
            propagator = propagator.name(),
            "work manager created"
        );
        Ok(Self {
            config,
            propagator,
            backend,
            state: ManagerState::Uninitialized,
            last_iteration: None,
            active_iteration: None,
            signal: ShutdownHandle::new(),
            report: None,
        })
    }

    /// Master or worker.
    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Kind of the bound backend.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Configuration in effect.
    pub fn config(&self) -> &WorkManagerConfig {
        &self.config
    }

    /// The bound propagator.
    pub fn propagator(&self) -> &Arc<P> {
        &self.propagator
    }

    /// The iteration between `prepare_iteration` and
    /// `finalize_iteration`, if any.
    pub fn active_iteration(&self) -> Option<IterationId> {
        self.active_iteration
    }

    /// The most recent iteration passed to `prepare_iteration`.
    pub fn last_iteration(&self) -> Option<IterationId> {
        self.last_iteration
    }

    /// A handle that requests shutdown from any thread, including while
    /// [`propagate`](Self::propagate) is running.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.signal.clone()
    }

    /// Acquire backend resources. Idempotent once prepared.
    ///
    /// # Errors
    ///
    /// [`WorkError::InvalidState`] after shutdown; [`WorkError::Backend`]
    /// if threads or worker processes cannot be started.
    pub fn prepare(&mut self) -> Result<(), WorkError> {
        match self.state {
            ManagerState::Uninitialized => {}
            ManagerState::ShuttingDown | ManagerState::Terminated => {
                return Err(self.invalid("prepare", "the manager is shut down"));
            }
            ManagerState::Prepared | ManagerState::IterationActive => return Ok(()),
        }
        self.backend.prepare(&self.propagator, &self.config)?;
        self.state = ManagerState::Prepared;
        info!(
            mode = %self.config.mode,
            backend = %self.backend.kind(),
            propagator = self.propagator.name(),
            "work manager prepared"
        );
        Ok(())
    }

    /// Replace the configuration, then [`prepare`](Self::prepare).
    ///
    /// # Errors
    ///
    /// - [`WorkError::AlreadyPrepared`] if the backend is already prepared
    ///   and `config` differs in any way, backend included.
    /// - [`ConfigError::Immutable`] if, before preparation, `config`
    ///   changes the mode or the backend kind chosen at construction.
    pub fn prepare_with(&mut self, config: WorkManagerConfig) -> Result<(), WorkError> {
        config.validate()?;
        match self.state {
            ManagerState::Uninitialized => {}
            ManagerState::Prepared | ManagerState::IterationActive => {
                if config != self.config {
                    return Err(WorkError::AlreadyPrepared);
                }
                return Ok(());
            }
            ManagerState::ShuttingDown | ManagerState::Terminated => {
                return Err(self.invalid("prepare", "the manager is shut down"));
            }
        }
        if config.mode != self.config.mode {
            return Err(ConfigError::Immutable {
                field: "mode",
                from: self.config.mode.to_string(),
                to: config.mode.to_string(),
            }
            .into());
        }
        if config.backend != self.config.backend {
            return Err(ConfigError::Immutable {
                field: "backend",
                from: self.config.backend.to_string(),
                to: config.backend.to_string(),
            }
            .into());
        }
        self.config = config;
        self.prepare()
    }

    /// Open iteration `iteration` and pass the batch to the propagator's
    /// `prepare_iteration` hook.
    ///
    /// # Errors
    ///
    /// - [`WorkError::InvalidState`] unless the manager is `Prepared` in
    ///   master mode, or if `iteration` does not increase. A shutdown
    ///   request seen here moves the manager to `ShuttingDown`.
    /// - [`WorkError::Propagator`] if the hook fails; the iteration is
    ///   not opened.
    pub fn prepare_iteration(
        &mut self,
        iteration: IterationId,
        batch: &Batch<P::Input, P::Output>,
    ) -> Result<(), WorkError> {
        self.require_master("prepare_iteration")?;
        match self.state {
            ManagerState::Prepared => {}
            ManagerState::IterationActive => {
                let detail = match self.active_iteration {
                    Some(active) => format!("iteration {active} is still active"),
                    None => "an iteration is still active".to_string(),
                };
                return Err(self.invalid("prepare_iteration", detail));
            }
            ManagerState::Uninitialized => {
                return Err(self.invalid("prepare_iteration", "call prepare() first"));
            }
            ManagerState::ShuttingDown | ManagerState::Terminated => {
                return Err(self.invalid("prepare_iteration", "the manager is shut down"));
            }
        }
        if self.signal.is_requested() {
            self.state = ManagerState::ShuttingDown;
            return Err(self.invalid("prepare_iteration", "shutdown was requested"));
        }
        if let Some(last) = self.last_iteration {
            if iteration <= last {
                return Err(self.invalid(
                    "prepare_iteration",
                    format!("iteration {iteration} does not follow iteration {last}"),
                ));
            }
        }

        self.propagator
            .prepare_iteration(iteration, batch.units())
            .map_err(|source| WorkError::Propagator {
                name: self.propagator.name().to_string(),
                hook: "prepare_iteration",
                source,
            })?;
        self.last_iteration = Some(iteration);
        self.active_iteration = Some(iteration);
        self.state = ManagerState::IterationActive;
        debug!(iteration = %iteration, units = batch.len(), "iteration prepared");
        Ok(())
    }

    /// Run every unit of `batch` to resolution on the backend.
    ///
    /// Results and failures are written into the batch in place, in
    /// submission order. Blocks until every unit is `Complete` or
    /// `Failed`.
    ///
    /// # Errors
    ///
    /// - [`WorkError::InvalidState`] outside `IterationActive`, or if a
    ///   unit belongs to another iteration.
    /// - [`WorkError::Propagation`] if any unit failed. The batch still
    ///   holds every unit, the failed ones included.
    /// - [`WorkError::Configuration`] if an input cannot be encoded for a
    ///   worker process; nothing was dispatched.
    /// - [`WorkError::Backend`] if the backend itself broke.
    pub fn propagate(&mut self, batch: &mut Batch<P::Input, P::Output>) -> Result<(), WorkError> {
        self.require_master("propagate")?;
        let iteration = match (self.state, self.active_iteration) {
            (ManagerState::IterationActive, Some(active)) => active,
            (ManagerState::ShuttingDown | ManagerState::Terminated, _) => {
                return Err(self.invalid("propagate", "the manager is shut down"));
            }
            _ => return Err(self.invalid("propagate", "call prepare_iteration() first")),
        };
        if let Some(stray) = batch.iter().find(|u| u.iteration() != iteration) {
            let detail = format!(
                "unit {} belongs to iteration {}, not {iteration}",
                stray.id(),
                stray.iteration()
            );
            return Err(self.invalid("propagate", detail));
        }

        let started = Instant::now();
        debug!(
            iteration = %iteration,
            units = batch.len(),
            backend = %self.backend.kind(),
            "propagating batch"
        );
        self.backend
            .propagate(&self.propagator, batch.units_mut(), &self.signal)?;

        let mut failures = Vec::new();
        for unit in batch.units_mut() {
            if !unit.is_resolved() {
                error!(unit = %unit.id(), "backend returned an unresolved unit");
                unit.fail_with(
                    FailureCause::Propagator,
                    "backend returned without resolving the unit",
                );
            }
            if let Some(failure) = unit.failure() {
                failures.push((unit.id(), failure.clone()));
            }
        }

        if self.signal.is_requested() {
            self.state = ManagerState::ShuttingDown;
        }
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if failures.is_empty() {
            debug!(iteration = %iteration, elapsed_ms, "batch complete");
            return Ok(());
        }
        let failure = PropagationFailure {
            iteration,
            total: batch.len(),
            failures,
        };
        warn!(
            iteration = %iteration,
            failed = failure.failures.len(),
            worker_lost = failure.count(FailureCause::WorkerLost),
            cancelled = failure.count(FailureCause::Cancelled),
            elapsed_ms,
            "batch finished with failed units"
        );
        Err(failure.into())
    }

    /// Close iteration `iteration` and pass the batch to the propagator's
    /// `finalize_iteration` hook.
    ///
    /// The iteration closes even if the hook fails.
    ///
    /// # Errors
    ///
    /// - [`WorkError::InvalidState`] outside `IterationActive`, or if
    ///   `iteration` is not the active one.
    /// - [`WorkError::Propagator`] if the hook fails.
    pub fn finalize_iteration(
        &mut self,
        iteration: IterationId,
        batch: &Batch<P::Input, P::Output>,
    ) -> Result<(), WorkError> {
        self.require_master("finalize_iteration")?;
        match (self.state, self.active_iteration) {
            (ManagerState::IterationActive, Some(active)) if active == iteration => {}
            (ManagerState::IterationActive, Some(active)) => {
                return Err(self.invalid(
                    "finalize_iteration",
                    format!("iteration {iteration} is not the active iteration {active}"),
                ));
            }
            _ => {
                return Err(self.invalid("finalize_iteration", "no iteration is active"));
            }
        }

        self.state = ManagerState::Prepared;
        self.active_iteration = None;
        self.propagator
            .finalize_iteration(iteration, batch.units())
            .map_err(|source| WorkError::Propagator {
                name: self.propagator.name().to_string(),
                hook: "finalize_iteration",
                source,
            })?;
        debug!(iteration = %iteration, "iteration finalized");
        Ok(())
    }

    /// Serve a master as a dedicated worker until it sends `Shutdown` or
    /// closes the channel. Prepares the manager first if needed.
    ///
    /// # Errors
    ///
    /// - [`WorkError::UnsupportedOperation`] on a backend without
    ///   dedicated workers, in either mode.
    /// - [`WorkError::InvalidState`] on a master-mode manager.
    /// - [`WorkError::Protocol`] if the channel carries a malformed frame.
    pub fn run_worker(&mut self) -> Result<(), WorkError> {
        let kind = self.backend.kind();
        if !kind.supports_dedicated_workers() {
            return Err(WorkError::UnsupportedOperation {
                operation: "run_worker",
                backend: kind,
            });
        }
        if self.config.mode != Mode::Worker {
            return Err(self.invalid("run_worker", "only worker-mode managers run a worker loop"));
        }
        self.prepare()?;
        self.backend.run_worker(&self.propagator)
    }

    /// Tear down the backend and return what happened.
    ///
    /// Signals workers to stop, waits up to the grace period, then
    /// reclaims whatever is left. Never fails. Later calls return the
    /// first report with `performed_teardown` set to `false`.
    pub fn shutdown(&mut self, exit_code: i32) -> ShutdownReport {
        if let Some(report) = &self.report {
            return ShutdownReport {
                performed_teardown: false,
                ..report.clone()
            };
        }

        self.signal.request(exit_code);
        let exit_code = self.signal.exit_code().unwrap_or(exit_code);
        let from = self.state;
        self.state = ManagerState::ShuttingDown;
        let started = Instant::now();
        let stats = self.backend.shutdown(self.config.grace_period());
        self.state = ManagerState::Terminated;
        self.active_iteration = None;

        let report = ShutdownReport {
            exit_code,
            elapsed: started.elapsed(),
            workers_joined: stats.workers_joined,
            workers_abandoned: stats.workers_abandoned,
            workers_killed: stats.workers_killed,
            performed_teardown: true,
        };
        info!(
            exit_code,
            from = %from,
            joined = report.workers_joined,
            abandoned = report.workers_abandoned,
            killed = report.workers_killed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "work manager shut down"
        );
        self.report = Some(report.clone());
        report
    }

    fn require_master(&self, operation: &'static str) -> Result<(), WorkError> {
        match self.config.mode {
            Mode::Master => Ok(()),
            Mode::Worker => Err(self.invalid(
                operation,
                "worker-mode managers only accept prepare, run_worker and shutdown",
            )),
        }
    }

    fn invalid(&self, operation: &'static str, detail: impl Into<String>) -> WorkError {
        WorkError::InvalidState {
            operation,
            state: self.state,
            detail: detail.into(),
        }
    }
}

impl<P: Propagator> Drop for WorkManager<P> {
    fn drop(&mut self) {
        if self.report.is_none() {
            self.shutdown(0);
        }
    }
}

impl<P: Propagator> fmt::Debug for WorkManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkManager")
            .field("mode", &self.config.mode)
            .field("backend", &self.backend.kind())
            .field("propagator", &self.propagator.name())
            .field("state", &self.state)
            .field("active_iteration", &self.active_iteration)
            .finish()
    }
}
