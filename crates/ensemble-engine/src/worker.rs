//! The dedicated worker loop run by each pooled process.
//!
//! [`serve`] reads `Assign` frames, runs the unit through the local
//! propagator, and writes a `Result` frame back, while a scoped heartbeat
//! thread writes `Heartbeat` frames on the same channel. It returns when
//! the master sends `Shutdown` or closes the channel.

use std::io::{BufReader, Read, Write};
use std::slice;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use ensemble_core::{
    FailureCause, IterationId, PropagateContext, Propagator, UnitFailure, UnitStatus,
    WirePayload, WorkUnit, WorkUnitId,
};
use tracing::{debug, info, warn};

use crate::backend::execute_units;
use crate::protocol::{read_frame, write_frame, Message, ProtocolError};

/// Units a worker loop served before it returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Units answered with `Complete`.
    pub completed: u64,
    /// Units answered with `Failed`.
    pub failed: u64,
}

/// Serve a master over `reader` / `writer` until `Shutdown` or EOF.
///
/// Nothing else may write to `writer` while this runs; in a worker
/// process that means the propagator must not print to stdout.
pub fn serve<P, R, W>(
    propagator: &P,
    reader: R,
    writer: W,
    heartbeat_interval: Duration,
) -> Result<WorkerSummary, ProtocolError>
where
    P: Propagator,
    R: Read,
    W: Write + Send,
{
    let writer = Mutex::new(writer);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

    thread::scope(|scope| {
        thread::Builder::new()
            .name("ensemble-heartbeat".into())
            .spawn_scoped(scope, || heartbeat_loop(&writer, &stop_rx, heartbeat_interval))?;
        let result = serve_frames(propagator, reader, &writer);
        // Disconnecting stops the heartbeat thread; the scope joins it.
        drop(stop_tx);
        result
    })
}

fn heartbeat_loop<W: Write>(writer: &Mutex<W>, stop: &Receiver<()>, interval: Duration) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let mut w = writer.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = write_frame(&mut *w, &Message::Heartbeat) {
                    debug!(error = %e, "heartbeat write failed; stopping heartbeats");
                    return;
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn serve_frames<P: Propagator, R: Read, W: Write>(
    propagator: &P,
    reader: R,
    writer: &Mutex<W>,
) -> Result<WorkerSummary, ProtocolError> {
    let mut reader = BufReader::new(reader);
    let mut summary = WorkerSummary::default();

    loop {
        let Some(message) = read_frame(&mut reader)? else {
            info!("master closed the channel");
            return Ok(summary);
        };
        match message {
            Message::Assign {
                iteration,
                id,
                attempt,
                input,
            } => {
                debug!(iteration = %iteration, unit = %id, attempt, "assigned unit");
                let reply = run_assignment(propagator, iteration, id, &input);
                match &reply {
                    Message::Result {
                        status: UnitStatus::Complete,
                        ..
                    } => summary.completed += 1,
                    _ => summary.failed += 1,
                }
                let mut w = writer.lock().unwrap_or_else(PoisonError::into_inner);
                write_frame(&mut *w, &reply)?;
            }
            Message::Shutdown => {
                info!(
                    completed = summary.completed,
                    failed = summary.failed,
                    "shutdown received"
                );
                return Ok(summary);
            }
            Message::Heartbeat => {}
            other => {
                warn!(kind = other.kind(), "protocol error: unexpected message from master; ignored");
            }
        }
    }
}

/// Decode, propagate, and encode one assigned unit.
fn run_assignment<P: Propagator>(
    propagator: &P,
    iteration: IterationId,
    id: WorkUnitId,
    input: &[u8],
) -> Message {
    let input = match <P::Input as WirePayload>::from_bytes(input) {
        Ok(input) => input,
        Err(e) => return failed(id, format!("input decode failed: {e}")),
    };
    let mut unit = WorkUnit::new(id, iteration, input);
    unit.begin();
    let ctx = PropagateContext::unlocked(iteration, None);
    execute_units(propagator, slice::from_mut(&mut unit), &ctx);

    if unit.status() == UnitStatus::Complete {
        return match unit.result().map(WirePayload::to_bytes) {
            Some(Ok(output)) => Message::Result {
                id,
                status: UnitStatus::Complete,
                output,
                failure: None,
            },
            Some(Err(e)) => failed(id, format!("result encode failed: {e}")),
            None => failed(id, "unit completed without a result"),
        };
    }
    let failure = unit
        .failure()
        .cloned()
        .unwrap_or_else(|| UnitFailure::new(FailureCause::Propagator, "unit left unresolved"));
    Message::Result {
        id,
        status: UnitStatus::Failed,
        output: Vec::new(),
        failure: Some(failure),
    }
}

fn failed(id: WorkUnitId, reason: impl Into<String>) -> Message {
    Message::Result {
        id,
        status: UnitStatus::Failed,
        output: Vec::new(),
        failure: Some(UnitFailure::new(FailureCause::Propagator, reason)),
    }
}
