//! Process pool backend: units run in dedicated worker processes.
//!
//! The master launches `pool_size` copies of the configured
//! [`WorkerCommand`] and talks to each over its stdin/stdout using the
//! framed [`protocol`](crate::protocol). One reader thread per worker
//! turns stdout frames into [`WorkerEvent`]s on a shared channel, so the
//! dispatch loop waits on a single receiver.
//!
//! # Crash isolation
//!
//! A worker that closes its output, exits, stops sending heartbeats for
//! `heartbeat_interval × missed_heartbeats`, or exceeds the optional unit
//! timeout is killed and replaced. The unit it held is retried up to
//! `max_retries` times and then fails with [`FailureCause::WorkerLost`].
//! Each replacement gets a new generation number; events from an older
//! generation of a slot are ignored.

use std::collections::VecDeque;
use std::env;
use std::io::{self, BufReader, BufWriter};
use std::marker::PhantomData;
use std::process::{Child, ChildStdin, ChildStdout, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use ensemble_core::{
    FailureCause, Propagator, UnitFailure, UnitStatus, WirePayload, WorkUnit, WorkUnitId,
    WorkerId,
};
use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::backend::{ExecutionBackend, ShutdownHandle, ShutdownStats, Units};
use crate::config::{
    BackendKind, ConfigError, Mode, WorkManagerConfig, WorkerCommand, HEARTBEAT_ENV,
};
use crate::error::{BackendError, WorkError};
use crate::protocol::{read_frame, write_frame, Message, ProtocolError};
use crate::worker;

/// How long the dispatch loop waits for an event before re-checking
/// liveness and shutdown requests.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Something a worker's reader thread observed.
enum WorkerEvent {
    /// A complete frame arrived.
    Frame {
        worker: WorkerId,
        generation: u64,
        message: Message,
    },
    /// The worker's output ended or became unreadable.
    Closed {
        worker: WorkerId,
        generation: u64,
        reason: String,
    },
}

/// A running worker process.
struct WorkerProcess {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
}

impl WorkerProcess {
    fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        match self.stdin.as_mut() {
            Some(stdin) => write_frame(stdin, message),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin closed").into()),
        }
    }
}

/// A unit held by a worker.
struct Assignment {
    index: usize,
    id: WorkUnitId,
    started: Instant,
}

/// One pool position. Keeps its id across process replacement.
struct WorkerSlot {
    id: WorkerId,
    generation: u64,
    process: Option<WorkerProcess>,
    assignment: Option<Assignment>,
    last_seen: Instant,
}

/// Settings resolved from the config at `prepare`.
struct PoolSettings {
    command: WorkerCommand,
    max_retries: u32,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    unit_timeout: Option<Duration>,
    grace: Duration,
}

/// Bookkeeping for one `propagate` call.
struct BatchRun {
    pending: VecDeque<usize>,
    in_flight: IndexMap<WorkUnitId, WorkerId>,
    losses: Vec<u32>,
    unresolved: usize,
    cancel_deadline: Option<Instant>,
}

impl BatchRun {
    fn new(len: usize) -> Self {
        Self {
            pending: (0..len).collect(),
            in_flight: IndexMap::new(),
            losses: vec![0; len],
            unresolved: len,
            cancel_deadline: None,
        }
    }
}

/// Pool of dedicated worker processes.
///
/// In [`Mode::Master`] `prepare` launches the workers. In
/// [`Mode::Worker`] nothing is launched and
/// [`run_worker`](ExecutionBackend::run_worker) serves the master over
/// this process's stdin and stdout.
pub struct ProcessPoolBackend<P> {
    mode: Mode,
    heartbeat_interval: Duration,
    settings: Option<PoolSettings>,
    slots: Vec<WorkerSlot>,
    next_generation: u64,
    /// Workers killed because a cancelled batch outlived the grace period.
    killed_in_flight: usize,
    events_tx: Sender<WorkerEvent>,
    events_rx: Receiver<WorkerEvent>,
    _marker: PhantomData<fn() -> P>,
}

impl<P> ProcessPoolBackend<P> {
    /// Create an unprepared pool.
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            mode: Mode::Master,
            heartbeat_interval: Duration::from_secs(1),
            settings: None,
            slots: Vec::new(),
            next_generation: 0,
            killed_in_flight: 0,
            events_tx,
            events_rx,
            _marker: PhantomData,
        }
    }

    /// Number of slots with a live worker process.
    pub fn live_workers(&self) -> usize {
        self.slots.iter().filter(|s| s.process.is_some()).count()
    }

    /// OS process ids of the live workers, by slot.
    pub fn worker_pids(&self) -> Vec<(WorkerId, u32)> {
        self.slots
            .iter()
            .filter_map(|s| s.process.as_ref().map(|p| (s.id, p.child.id())))
            .collect()
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn slot_index(&self, worker: WorkerId, generation: u64) -> Option<usize> {
        let index = worker.0 as usize;
        self.slots
            .get(index)
            .filter(|s| s.generation == generation && s.process.is_some())
            .map(|_| index)
    }

    /// Kill the slot's process and, if `respawn`, start a replacement.
    fn replace_worker(&mut self, index: usize, reason: &str, respawn: bool) {
        let generation = self.bump_generation();
        let Some(settings) = self.settings.as_ref() else {
            return;
        };
        let slot = &mut self.slots[index];
        warn!(
            worker = %slot.id,
            generation = slot.generation,
            reason,
            "worker process lost"
        );
        if let Some(process) = slot.process.take() {
            reclaim(slot.id, process);
        }
        if !respawn {
            return;
        }
        match spawn_worker(settings, slot.id, generation, &self.events_tx) {
            Ok(process) => {
                slot.process = Some(process);
                slot.generation = generation;
                slot.last_seen = Instant::now();
            }
            Err(e) => error!(worker = %slot.id, error = %e, "could not replace worker process"),
        }
    }

    /// Kill every worker process without waiting.
    fn kill_all(&mut self) -> usize {
        let mut killed = 0;
        for slot in &mut self.slots {
            if let Some(process) = slot.process.take() {
                if reclaim(slot.id, process) {
                    killed += 1;
                }
            }
        }
        killed
    }
}

impl<P> Default for ProcessPoolBackend<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Propagator> ProcessPoolBackend<P> {
    /// Handle events that arrived while no batch was running: heartbeats
    /// and workers that died while idle.
    fn drain_idle_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                WorkerEvent::Frame {
                    worker, message, ..
                } => {
                    if !matches!(message, Message::Heartbeat) {
                        warn!(
                            worker = %worker,
                            kind = message.kind(),
                            "protocol error: unsolicited message from idle worker; ignored"
                        );
                    }
                }
                WorkerEvent::Closed {
                    worker,
                    generation,
                    reason,
                } => {
                    if let Some(index) = self.slot_index(worker, generation) {
                        self.replace_worker(index, &reason, true);
                    }
                }
            }
        }
        let now = Instant::now();
        for slot in &mut self.slots {
            slot.last_seen = now;
        }
    }

    /// Hand pending units to idle workers.
    fn dispatch(&mut self, units: &mut Units<P>, encoded: &[Vec<u8>], run: &mut BatchRun) {
        for index in 0..self.slots.len() {
            if run.pending.is_empty() {
                return;
            }
            let slot = &mut self.slots[index];
            if slot.assignment.is_some() {
                continue;
            }
            let Some(process) = slot.process.as_mut() else {
                continue;
            };
            let Some(unit_index) = run.pending.pop_front() else {
                return;
            };

            let unit = &mut units[unit_index];
            unit.begin();
            let message = Message::Assign {
                iteration: unit.iteration(),
                id: unit.id(),
                attempt: unit.attempts(),
                input: encoded[unit_index].clone(),
            };
            slot.assignment = Some(Assignment {
                index: unit_index,
                id: unit.id(),
                started: Instant::now(),
            });
            run.in_flight.insert(unit.id(), slot.id);

            match process.send(&message) {
                Ok(()) => debug!(
                    worker = %slot.id,
                    unit = %unit.id(),
                    attempt = unit.attempts(),
                    "assigned unit"
                ),
                Err(e) => {
                    let reason = format!("could not send assignment: {e}");
                    self.lose_worker(index, &reason, units, run);
                }
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent, units: &mut Units<P>, run: &mut BatchRun) {
        match event {
            WorkerEvent::Frame {
                worker,
                generation,
                message,
            } => {
                let Some(index) = self.slot_index(worker, generation) else {
                    return;
                };
                let slot = &mut self.slots[index];
                slot.last_seen = Instant::now();
                match message {
                    Message::Heartbeat => {}
                    Message::Result {
                        id,
                        status,
                        output,
                        failure,
                    } => {
                        let holds = slot.assignment.as_ref().is_some_and(|a| a.id == id);
                        let assignment = match slot.assignment.take() {
                            Some(a) if holds => a,
                            other => {
                                slot.assignment = other;
                                warn!(
                                    worker = %worker,
                                    unit = %id,
                                    "protocol error: result for a unit this worker does not hold; ignored"
                                );
                                return;
                            }
                        };
                        run.in_flight.shift_remove(&id);
                        run.unresolved -= 1;
                        let unit = &mut units[assignment.index];
                        settle(unit, status, &output, failure);
                        debug!(
                            worker = %worker,
                            unit = %id,
                            status = %unit.status(),
                            elapsed_ms = assignment.started.elapsed().as_millis() as u64,
                            "unit finished"
                        );
                    }
                    other => warn!(
                        worker = %worker,
                        kind = other.kind(),
                        "protocol error: unexpected message from worker; ignored"
                    ),
                }
            }
            WorkerEvent::Closed {
                worker,
                generation,
                reason,
            } => {
                if let Some(index) = self.slot_index(worker, generation) {
                    self.lose_worker(index, &reason, units, run);
                }
            }
        }
    }

    /// Kill workers that went silent or overran the unit timeout.
    fn check_liveness(&mut self, units: &mut Units<P>, run: &mut BatchRun) {
        let Some(settings) = self.settings.as_ref() else {
            return;
        };
        let now = Instant::now();
        let mut lost = Vec::new();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.process.is_none() {
                continue;
            }
            let silent = now.saturating_duration_since(slot.last_seen);
            if silent > settings.heartbeat_timeout {
                lost.push((index, format!("no heartbeat for {} ms", silent.as_millis())));
                continue;
            }
            if let (Some(limit), Some(a)) = (settings.unit_timeout, &slot.assignment) {
                if now.saturating_duration_since(a.started) > limit {
                    lost.push((
                        index,
                        format!("unit {} exceeded the {} ms unit timeout", a.id, limit.as_millis()),
                    ));
                }
            }
        }
        for (index, reason) in lost {
            self.lose_worker(index, &reason, units, run);
        }
    }

    /// Replace a lost worker and retry, fail, or cancel the unit it held.
    fn lose_worker(&mut self, index: usize, reason: &str, units: &mut Units<P>, run: &mut BatchRun) {
        let cancelling = run.cancel_deadline.is_some();
        let assignment = self.slots[index].assignment.take();
        self.replace_worker(index, reason, !cancelling);

        let Some(assignment) = assignment else {
            return;
        };
        let max_retries = self.settings.as_ref().map_or(0, |s| s.max_retries);
        run.in_flight.shift_remove(&assignment.id);
        run.losses[assignment.index] += 1;
        let losses = run.losses[assignment.index];
        let unit = &mut units[assignment.index];

        if cancelling {
            unit.fail_with(
                FailureCause::Cancelled,
                format!("worker lost during shutdown: {reason}"),
            );
            run.unresolved -= 1;
        } else if losses <= max_retries {
            info!(
                unit = %assignment.id,
                retry = losses,
                max_retries,
                "retrying unit after worker loss"
            );
            unit.requeue();
            run.pending.push_front(assignment.index);
        } else {
            warn!(unit = %assignment.id, losses, "retry budget exhausted");
            unit.fail_with(
                FailureCause::WorkerLost,
                format!("{reason}; gave up after {losses} lost attempt(s)"),
            );
            run.unresolved -= 1;
        }
    }

    /// Stop dispatching: cancel every pending unit and start the grace
    /// period for in-flight ones.
    fn begin_cancel(&mut self, units: &mut Units<P>, run: &mut BatchRun) {
        let grace = self.settings.as_ref().map_or(Duration::ZERO, |s| s.grace);
        run.cancel_deadline = Some(Instant::now() + grace);
        let cancelled = run.pending.len();
        for index in run.pending.drain(..) {
            units[index].fail_with(FailureCause::Cancelled, "shutdown requested before dispatch");
        }
        run.unresolved -= cancelled;
        info!(
            cancelled,
            in_flight = run.in_flight.len(),
            "shutdown requested; waiting for in-flight units"
        );
    }

    /// Grace period over: cancel in-flight units and kill their workers.
    fn abandon_in_flight(&mut self, units: &mut Units<P>, run: &mut BatchRun) {
        for slot in &mut self.slots {
            let Some(assignment) = slot.assignment.take() else {
                continue;
            };
            warn!(worker = %slot.id, unit = %assignment.id, "unit abandoned after grace period");
            units[assignment.index].fail_with(
                FailureCause::Cancelled,
                "abandoned after shutdown grace period",
            );
            run.in_flight.shift_remove(&assignment.id);
            run.unresolved -= 1;
            if let Some(process) = slot.process.take() {
                if reclaim(slot.id, process) {
                    self.killed_in_flight += 1;
                }
            }
        }
    }

    /// Fail every pending unit when no worker is left to run it.
    fn fail_stranded(&mut self, units: &mut Units<P>, run: &mut BatchRun) {
        let stranded = run.pending.len();
        for index in run.pending.drain(..) {
            units[index].fail_with(FailureCause::WorkerLost, "no live worker processes remain");
        }
        run.unresolved -= stranded;
        error!(stranded, "no live worker processes remain; failing pending units");
    }
}

impl<P: Propagator> ExecutionBackend<P> for ProcessPoolBackend<P> {
    fn kind(&self) -> BackendKind {
        BackendKind::ProcessPool
    }

    fn prepare(&mut self, _propagator: &Arc<P>, config: &WorkManagerConfig) -> Result<(), WorkError> {
        self.mode = config.mode;
        if config.mode == Mode::Worker {
            let inherited = env::var(HEARTBEAT_ENV).ok();
            self.heartbeat_interval = config.worker_heartbeat_interval(inherited.as_deref());
            return Ok(());
        }
        if self.settings.is_some() {
            return Ok(());
        }

        let command = config
            .worker_command
            .clone()
            .ok_or(ConfigError::MissingWorkerCommand)?;
        let pool_size = config.resolved_pool_size();
        let settings = PoolSettings {
            command,
            max_retries: config.max_retries,
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            unit_timeout: config.unit_timeout(),
            grace: config.grace_period(),
        };

        for i in 0..pool_size {
            let id = WorkerId(i as u32);
            let generation = self.bump_generation();
            match spawn_worker(&settings, id, generation, &self.events_tx) {
                Ok(process) => self.slots.push(WorkerSlot {
                    id,
                    generation,
                    process: Some(process),
                    assignment: None,
                    last_seen: Instant::now(),
                }),
                Err(e) => {
                    self.kill_all();
                    self.slots.clear();
                    return Err(e.into());
                }
            }
        }
        info!(
            pool_size,
            program = %settings.command.program.display(),
            heartbeat_ms = settings.heartbeat_interval.as_millis() as u64,
            "process pool started"
        );
        self.settings = Some(settings);
        Ok(())
    }

    fn propagate(
        &mut self,
        _propagator: &Arc<P>,
        units: &mut Units<P>,
        shutdown: &ShutdownHandle,
    ) -> Result<(), WorkError> {
        if self.settings.is_none() {
            return Err(BackendError::NotPrepared.into());
        }

        // Every input must be encodable before anything is dispatched.
        let mut encoded = Vec::with_capacity(units.len());
        for unit in units.iter() {
            let bytes = unit
                .input()
                .to_bytes()
                .map_err(|e| ConfigError::PayloadNotSerializable {
                    id: unit.id(),
                    reason: e.to_string(),
                })?;
            encoded.push(bytes);
        }

        self.drain_idle_events();
        let mut run = BatchRun::new(units.len());

        while run.unresolved > 0 {
            if shutdown.is_requested() && run.cancel_deadline.is_none() {
                self.begin_cancel(units, &mut run);
            }
            match run.cancel_deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    self.abandon_in_flight(units, &mut run);
                    break;
                }
                Some(_) => {}
                None => {
                    self.dispatch(units, &encoded, &mut run);
                    if self.live_workers() == 0 && !run.pending.is_empty() {
                        self.fail_stranded(units, &mut run);
                        continue;
                    }
                }
            }
            if run.unresolved == 0 {
                break;
            }

            if let Ok(event) = self.events_rx.recv_timeout(POLL_INTERVAL) {
                self.handle_event(event, units, &mut run);
            }
            self.check_liveness(units, &mut run);
        }
        Ok(())
    }

    fn run_worker(&mut self, propagator: &Arc<P>) -> Result<(), WorkError> {
        info!(
            pid = std::process::id(),
            propagator = propagator.name(),
            "worker loop started"
        );
        let stdin = io::stdin().lock();
        let stdout = BufWriter::new(io::stdout());
        let summary = worker::serve(&**propagator, stdin, stdout, self.heartbeat_interval)?;
        info!(
            completed = summary.completed,
            failed = summary.failed,
            "worker loop finished"
        );
        Ok(())
    }

    fn shutdown(&mut self, grace: Duration) -> ShutdownStats {
        let mut stats = ShutdownStats::default();
        for slot in &mut self.slots {
            if let Some(process) = slot.process.as_mut() {
                if let Err(e) = process.send(&Message::Shutdown) {
                    debug!(worker = %slot.id, error = %e, "could not deliver shutdown");
                }
                // Closing stdin also ends a worker that missed the message.
                process.stdin.take();
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            let mut running = 0;
            for slot in &mut self.slots {
                let exited = match slot.process.as_mut().map(|p| p.child.try_wait()) {
                    None => continue,
                    Some(Ok(Some(status))) => {
                        debug!(worker = %slot.id, %status, "worker process exited");
                        true
                    }
                    Some(Ok(None)) => false,
                    Some(Err(e)) => {
                        error!(worker = %slot.id, error = %e, "could not poll worker process");
                        false
                    }
                };
                if exited {
                    slot.process = None;
                    stats.workers_joined += 1;
                } else {
                    running += 1;
                }
            }
            if running == 0 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let stragglers = self.kill_all();
        stats.workers_killed = stragglers + std::mem::take(&mut self.killed_in_flight);
        if stragglers > 0 {
            warn!(
                killed = stragglers,
                "worker processes still running after grace period; killed"
            );
        }
        self.slots.clear();
        self.settings = None;
        if self.mode == Mode::Master {
            info!(
                joined = stats.workers_joined,
                killed = stats.workers_killed,
                "process pool stopped"
            );
        }
        stats
    }
}

impl<P> Drop for ProcessPoolBackend<P> {
    fn drop(&mut self) {
        // Never leave orphaned workers behind.
        let killed = self.kill_all();
        if killed > 0 {
            debug!(killed, "killed worker processes on drop");
        }
    }
}

/// Resolve a unit from a worker's `Result` frame.
fn settle<I, O: WirePayload>(
    unit: &mut WorkUnit<I, O>,
    status: UnitStatus,
    output: &[u8],
    failure: Option<UnitFailure>,
) {
    match status {
        UnitStatus::Complete => match O::from_bytes(output) {
            Ok(result) => unit.complete(result),
            Err(e) => unit.fail_with(FailureCause::Propagator, format!("result decode failed: {e}")),
        },
        UnitStatus::Failed => unit.fail(failure.unwrap_or_else(|| {
            UnitFailure::new(FailureCause::Propagator, "worker reported failure without detail")
        })),
        other => unit.fail_with(
            FailureCause::Propagator,
            format!("worker reported unresolved status {other}"),
        ),
    }
}

/// Launch one worker process and its reader thread. The worker is told
/// the pool's heartbeat interval through [`HEARTBEAT_ENV`].
fn spawn_worker(
    settings: &PoolSettings,
    worker: WorkerId,
    generation: u64,
    events: &Sender<WorkerEvent>,
) -> Result<WorkerProcess, BackendError> {
    let mut cmd = settings.command.to_command();
    cmd.env(HEARTBEAT_ENV, settings.heartbeat_interval.as_millis().to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    let mut child = cmd
        .spawn()
        .map_err(|source| BackendError::Spawn { worker, source })?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(BackendError::Spawn {
            worker,
            source: io::Error::other("worker stdio was not captured"),
        });
    };

    let events = events.clone();
    let reader = thread::Builder::new()
        .name(format!("ensemble-pool-reader-{worker}"))
        .spawn(move || reader_loop(worker, generation, stdout, events));
    if let Err(e) = reader {
        let _ = child.kill();
        let _ = child.wait();
        return Err(BackendError::ThreadSpawnFailed {
            reason: format!("reader for worker {worker}: {e}"),
        });
    }

    debug!(worker = %worker, pid = child.id(), generation, "spawned worker process");
    Ok(WorkerProcess {
        child,
        stdin: Some(BufWriter::new(stdin)),
    })
}

/// Forward frames from a worker's stdout until it closes.
fn reader_loop(worker: WorkerId, generation: u64, stdout: ChildStdout, events: Sender<WorkerEvent>) {
    let mut reader = BufReader::new(stdout);
    let reason = loop {
        match read_frame(&mut reader) {
            Ok(Some(message)) => {
                let event = WorkerEvent::Frame {
                    worker,
                    generation,
                    message,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => break "worker closed its output".to_string(),
            Err(e) => break format!("unreadable worker output: {e}"),
        }
    };
    let _ = events.send(WorkerEvent::Closed {
        worker,
        generation,
        reason,
    });
}

/// Kill (if still running) and reap a worker process. Returns `true` if
/// it had to be killed.
fn reclaim(worker: WorkerId, mut process: WorkerProcess) -> bool {
    process.stdin.take();
    let killed = match process.child.try_wait() {
        Ok(Some(status)) => {
            debug!(worker = %worker, %status, "worker process already exited");
            return false;
        }
        Ok(None) => true,
        Err(e) => {
            error!(worker = %worker, error = %e, "could not poll worker process");
            true
        }
    };
    if let Err(e) = process.child.kill() {
        error!(worker = %worker, error = %e, "could not kill worker process");
    }
    if let Err(e) = process.child.wait() {
        error!(worker = %worker, error = %e, "could not reap worker process");
    }
    killed
}
