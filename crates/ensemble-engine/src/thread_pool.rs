//! Thread pool backend: N named threads sharing one propagator.
//!
//! Each pool thread pulls [`ThreadTask`]s from a bounded crossbeam queue,
//! runs the unit, and sends it back over the task's reply channel. Units
//! move by value: while a thread holds a unit, the caller's slot holds a
//! detached placeholder, so no unit is ever reachable from two threads.
//!
//! Propagator calls are serialized by a pool-wide lock unless the
//! propagator declares [`Concurrency::ThreadSafe`]. The lock is released
//! inside [`PropagateContext::isolated`].

use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ensemble_core::{
    Concurrency, FailureCause, PropagateContext, Propagator, WorkUnit, WorkerId,
};
use indexmap::IndexSet;
use tracing::{debug, info, warn};

use crate::backend::{
    cancel_unresolved, execute_units, ExecutionBackend, ShutdownHandle, ShutdownStats, Units,
};
use crate::config::{BackendKind, WorkManagerConfig};
use crate::error::{BackendError, WorkError};

/// How often a blocked `propagate` re-checks for a shutdown request.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Unit<P> = WorkUnit<<P as Propagator>::Input, <P as Propagator>::Output>;

/// A unit handed to a pool thread.
struct ThreadTask<P: Propagator> {
    index: usize,
    unit: Unit<P>,
    reply: Sender<ThreadReply<P>>,
}

/// A unit handed back, resolved.
struct ThreadReply<P: Propagator> {
    index: usize,
    unit: Unit<P>,
}

/// State shared between the backend and its threads.
struct PoolShared {
    lock: Mutex<()>,
    /// Set on a shutdown request; threads cancel queued tasks instead of
    /// running them.
    cancelled: AtomicBool,
}

/// In-process pool of worker threads.
pub struct ThreadPoolBackend<P: Propagator> {
    task_tx: Option<Sender<ThreadTask<P>>>,
    threads: Vec<JoinHandle<()>>,
    shared: Arc<PoolShared>,
    grace: Duration,
}

impl<P: Propagator> ThreadPoolBackend<P> {
    /// Create an unprepared pool. Threads start in `prepare`.
    pub fn new() -> Self {
        Self {
            task_tx: None,
            threads: Vec::new(),
            shared: Arc::new(PoolShared {
                lock: Mutex::new(()),
                cancelled: AtomicBool::new(false),
            }),
            grace: Duration::ZERO,
        }
    }

    /// Number of running pool threads.
    pub fn pool_size(&self) -> usize {
        self.threads.len()
    }
}

impl<P: Propagator> Default for ThreadPoolBackend<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Propagator> ExecutionBackend<P> for ThreadPoolBackend<P> {
    fn kind(&self) -> BackendKind {
        BackendKind::ThreadPool
    }

    fn prepare(&mut self, propagator: &Arc<P>, config: &WorkManagerConfig) -> Result<(), WorkError> {
        if self.task_tx.is_some() {
            return Ok(());
        }
        let pool_size = config.resolved_pool_size();
        let (task_tx, task_rx) = crossbeam_channel::bounded(config.resolved_queue_depth());
        self.shared.cancelled.store(false, Ordering::Release);
        self.grace = config.grace_period();

        for i in 0..pool_size {
            let rx = task_rx.clone();
            let propagator = Arc::clone(propagator);
            let shared = Arc::clone(&self.shared);
            let worker = WorkerId(i as u32);
            let handle = thread::Builder::new()
                .name(format!("ensemble-worker-{i}"))
                .spawn(move || worker_loop(worker, propagator, rx, shared))
                .map_err(|e| BackendError::ThreadSpawnFailed {
                    reason: format!("ensemble-worker-{i}: {e}"),
                })?;
            self.threads.push(handle);
        }
        self.task_tx = Some(task_tx);
        info!(
            pool_size,
            propagator = propagator.name(),
            concurrency = ?propagator.concurrency(),
            "thread pool started"
        );
        Ok(())
    }

    fn propagate(
        &mut self,
        _propagator: &Arc<P>,
        units: &mut Units<P>,
        shutdown: &ShutdownHandle,
    ) -> Result<(), WorkError> {
        let task_tx = self.task_tx.as_ref().ok_or(BackendError::NotPrepared)?;
        let (reply_tx, reply_rx) = crossbeam_channel::unbounded();
        let total = units.len();
        let mut next = 0;
        let mut in_flight: IndexSet<usize> = IndexSet::with_capacity(total);

        loop {
            // Dispatch until the queue is full.
            while next < total && !shutdown.is_requested() {
                let placeholder = units[next].detached();
                let unit = std::mem::replace(&mut units[next], placeholder);
                let task = ThreadTask {
                    index: next,
                    unit,
                    reply: reply_tx.clone(),
                };
                match task_tx.try_send(task) {
                    Ok(()) => {
                        debug!(unit = %units[next].id(), "queued unit");
                        in_flight.insert(next);
                        next += 1;
                    }
                    Err(TrySendError::Full(task)) => {
                        units[task.index] = task.unit;
                        break;
                    }
                    Err(TrySendError::Disconnected(task)) => {
                        units[task.index] = task.unit;
                        return Err(BackendError::PoolDisconnected.into());
                    }
                }
            }

            if next == total && in_flight.is_empty() {
                return Ok(());
            }

            if shutdown.is_requested() {
                self.shared.cancelled.store(true, Ordering::Release);
                let cancelled =
                    cancel_unresolved(&mut units[next..], "shutdown requested before dispatch");
                info!(
                    cancelled,
                    in_flight = in_flight.len(),
                    "shutdown requested; waiting for in-flight units"
                );
                self.collect_until(&reply_rx, units, &mut in_flight, Instant::now() + self.grace);
                for &index in &in_flight {
                    warn!(unit = %units[index].id(), "unit abandoned after grace period");
                    units[index].fail_with(
                        FailureCause::Cancelled,
                        "abandoned after shutdown grace period",
                    );
                }
                return Ok(());
            }

            match reply_rx.recv_timeout(POLL_INTERVAL) {
                Ok(reply) => accept(units, &mut in_flight, reply),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BackendError::PoolDisconnected.into())
                }
            }
        }
    }

    fn shutdown(&mut self, grace: Duration) -> ShutdownStats {
        self.shared.cancelled.store(true, Ordering::Release);
        // Closing the queue ends every idle thread's recv loop.
        self.task_tx.take();

        let deadline = Instant::now() + grace;
        while self.threads.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        let mut stats = ShutdownStats::default();
        for handle in self.threads.drain(..) {
            if handle.is_finished() {
                if handle.join().is_ok() {
                    stats.workers_joined += 1;
                }
            } else {
                // Threads are never killed; a stuck one is detached.
                stats.workers_abandoned += 1;
            }
        }
        if stats.workers_abandoned > 0 {
            warn!(
                abandoned = stats.workers_abandoned,
                "pool threads still busy after grace period; detached"
            );
        }
        info!(joined = stats.workers_joined, "thread pool stopped");
        stats
    }
}

impl<P: Propagator> ThreadPoolBackend<P> {
    fn collect_until(
        &self,
        reply_rx: &Receiver<ThreadReply<P>>,
        units: &mut Units<P>,
        in_flight: &mut IndexSet<usize>,
        deadline: Instant,
    ) {
        while !in_flight.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match reply_rx.recv_timeout(remaining) {
                Ok(reply) => accept(units, in_flight, reply),
                Err(_) => break,
            }
        }
    }
}

impl<P: Propagator> Drop for ThreadPoolBackend<P> {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            let grace = self.grace;
            ExecutionBackend::<P>::shutdown(self, grace);
        }
    }
}

fn accept<P: Propagator>(
    units: &mut Units<P>,
    in_flight: &mut IndexSet<usize>,
    reply: ThreadReply<P>,
) {
    if in_flight.swap_remove(&reply.index) {
        units[reply.index] = reply.unit;
    }
}

/// Main loop for a pool thread.
///
/// Runs until the task queue is closed. Each task: check for cancellation,
/// take the propagation lock unless the propagator is thread-safe, run the
/// unit, reply.
fn worker_loop<P: Propagator>(
    worker: WorkerId,
    propagator: Arc<P>,
    task_rx: Receiver<ThreadTask<P>>,
    shared: Arc<PoolShared>,
) {
    while let Ok(task) = task_rx.recv() {
        let ThreadTask {
            index,
            mut unit,
            reply,
        } = task;

        if shared.cancelled.load(Ordering::Acquire) {
            unit.fail_with(
                FailureCause::Cancelled,
                "shutdown requested before dispatch",
            );
        } else {
            unit.begin();
            let iteration = unit.iteration();
            let ctx = match propagator.concurrency() {
                Concurrency::ThreadSafe => PropagateContext::unlocked(iteration, Some(worker)),
                Concurrency::Serialized => {
                    PropagateContext::locked(iteration, Some(worker), &shared.lock)
                }
            };
            execute_units(&*propagator, slice::from_mut(&mut unit), &ctx);
            drop(ctx);
        }

        // The caller may have stopped listening after its grace period.
        let _ = reply.send(ThreadReply { index, unit });
    }
    debug!(worker = %worker, "pool thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::{Batch, IterationId, UnitStatus, WorkUnitId};
    use ensemble_test_utils::{
        IsolatingPropagator, PanickingPropagator, SleepPropagator, SquarePropagator,
    };

    fn config(pool_size: usize) -> WorkManagerConfig {
        WorkManagerConfig {
            backend: BackendKind::ThreadPool,
            pool_size: Some(pool_size),
            grace_period_ms: 2000,
            ..WorkManagerConfig::default()
        }
    }

    fn prepared<P: Propagator>(prop: &Arc<P>, pool_size: usize) -> ThreadPoolBackend<P> {
        let mut backend = ThreadPoolBackend::new();
        backend.prepare(prop, &config(pool_size)).unwrap();
        backend
    }

    #[test]
    fn results_match_submission_slots() {
        let prop = Arc::new(SquarePropagator::new());
        let mut backend = prepared(&prop, 3);
        assert_eq!(backend.pool_size(), 3);
        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), 0..50);
        backend
            .propagate(&prop, batch.units_mut(), &ShutdownHandle::new())
            .unwrap();
        for (i, unit) in batch.iter().enumerate() {
            assert_eq!(unit.id(), WorkUnitId(i as u64));
            assert_eq!(unit.result(), Some(&((i * i) as u64)));
            assert_eq!(unit.attempts(), 1);
        }
        let stats = backend.shutdown(Duration::from_secs(2));
        assert_eq!(stats.workers_joined, 3);
    }

    #[test]
    fn small_queue_still_drains_large_batch() {
        let prop = Arc::new(SquarePropagator::new());
        let mut backend = ThreadPoolBackend::<SquarePropagator>::new();
        let cfg = WorkManagerConfig {
            queue_depth: Some(1),
            ..config(2)
        };
        backend.prepare(&prop, &cfg).unwrap();
        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), 0..20);
        backend
            .propagate(&prop, batch.units_mut(), &ShutdownHandle::new())
            .unwrap();
        assert!(batch.iter().all(|u| u.status() == UnitStatus::Complete));
    }

    #[test]
    fn panic_fails_only_that_unit() {
        let prop = Arc::new(PanickingPropagator::new([WorkUnitId(2)]));
        let mut backend = prepared(&prop, 2);
        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), 0..4);
        backend
            .propagate(&prop, batch.units_mut(), &ShutdownHandle::new())
            .unwrap();
        for unit in &batch {
            if unit.id() == WorkUnitId(2) {
                assert_eq!(unit.failure().map(|f| f.cause), Some(FailureCause::Propagator));
            } else {
                assert_eq!(unit.status(), UnitStatus::Complete);
            }
        }

        // Threads survived the panic.
        let mut again: Batch<u64, u64> = Batch::from_inputs(IterationId(2), [7]);
        backend
            .propagate(&prop, again.units_mut(), &ShutdownHandle::new())
            .unwrap();
        assert_eq!(again.units()[0].result(), Some(&49));
    }

    #[test]
    fn serialized_propagator_never_overlaps_outside_isolation() {
        let prop = Arc::new(SleepPropagator::serialized(Duration::from_millis(5)));
        let mut backend = prepared(&prop, 4);
        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), 0..16);
        backend
            .propagate(&prop, batch.units_mut(), &ShutdownHandle::new())
            .unwrap();
        assert_eq!(prop.max_concurrent(), 1);
    }

    #[test]
    fn thread_safe_propagator_runs_in_parallel() {
        let prop = Arc::new(SleepPropagator::thread_safe(Duration::from_millis(50)));
        let mut backend = prepared(&prop, 4);
        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), 0..8);
        backend
            .propagate(&prop, batch.units_mut(), &ShutdownHandle::new())
            .unwrap();
        assert!(prop.max_concurrent() > 1, "no overlap observed");
    }

    #[test]
    fn isolated_sections_overlap_under_the_lock() {
        let delay = Duration::from_millis(100);
        let prop = Arc::new(IsolatingPropagator::new(delay));
        let mut backend = prepared(&prop, 2);
        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), 0..4);
        let start = Instant::now();
        backend
            .propagate(&prop, batch.units_mut(), &ShutdownHandle::new())
            .unwrap();
        let elapsed = start.elapsed();
        assert!(batch.iter().all(|u| u.status() == UnitStatus::Complete));
        assert!(prop.max_isolated_overlap() >= 2);
        assert!(elapsed < delay * 4, "took {elapsed:?}, expected overlap");
    }

    #[test]
    fn shutdown_request_cancels_queued_and_waits_for_running() {
        let prop = Arc::new(SleepPropagator::thread_safe(Duration::from_millis(200)));
        let mut backend = prepared(&prop, 2);
        let handle = ShutdownHandle::new();
        let trigger = handle.clone();
        let requester = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.request(7);
        });

        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), 0..6);
        backend.propagate(&prop, batch.units_mut(), &handle).unwrap();
        requester.join().unwrap();

        assert!(batch.is_resolved());
        let complete = batch
            .iter()
            .filter(|u| u.status() == UnitStatus::Complete)
            .count();
        let cancelled = batch
            .iter()
            .filter(|u| u.failure().map(|f| f.cause) == Some(FailureCause::Cancelled))
            .count();
        assert_eq!(complete, 2, "the two running units finish within grace");
        assert_eq!(cancelled, 4);
    }

    #[test]
    fn stuck_threads_are_abandoned_after_grace() {
        let prop = Arc::new(SleepPropagator::thread_safe(Duration::from_millis(500)));
        let mut backend = prepared(&prop, 1);
        let handle = ShutdownHandle::new();
        let trigger = handle.clone();
        let requester = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            trigger.request(0);
        });
        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), [1]);
        backend.grace = Duration::from_millis(20);
        backend.propagate(&prop, batch.units_mut(), &handle).unwrap();
        requester.join().unwrap();
        assert_eq!(
            batch.units()[0].failure().map(|f| f.cause),
            Some(FailureCause::Cancelled)
        );

        let stats = backend.shutdown(Duration::from_millis(10));
        assert_eq!(stats.workers_abandoned, 1);
        assert_eq!(stats.workers_joined, 0);
    }

    #[test]
    fn propagate_before_prepare_fails() {
        let prop = Arc::new(SquarePropagator::new());
        let mut backend = ThreadPoolBackend::<SquarePropagator>::new();
        let mut batch: Batch<u64, u64> = Batch::from_inputs(IterationId(1), [1]);
        match backend.propagate(&prop, batch.units_mut(), &ShutdownHandle::new()) {
            Err(WorkError::Backend(BackendError::NotPrepared)) => {}
            other => panic!("expected NotPrepared, got {other:?}"),
        }
    }

    #[test]
    fn run_worker_is_unsupported() {
        let prop = Arc::new(SquarePropagator::new());
        let mut backend = prepared(&prop, 1);
        match backend.run_worker(&prop) {
            Err(WorkError::UnsupportedOperation {
                backend: BackendKind::ThreadPool,
                ..
            }) => {}
            other => panic!("expected UnsupportedOperation, got {other:?}"),
        }
    }
}
