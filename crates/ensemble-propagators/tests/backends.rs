//! RandomWalk through the work manager on the in-process backends.

use std::time::Duration;

use ensemble_core::{Batch, FailureCause, IterationId, WorkUnitId};
use ensemble_engine::{BackendKind, WorkError, WorkManager, WorkManagerConfig};
use ensemble_propagators::{Fault, RandomWalk, WalkInput, WalkOutput};

fn walkers(iteration: u64, n: u64) -> Batch<WalkInput, WalkOutput> {
    Batch::from_inputs(
        IterationId(iteration),
        (0..n).map(|i| WalkInput::new(iteration * 1_000 + i, 50)),
    )
}

fn run_iterations(kind: BackendKind, iterations: u64) -> Vec<Vec<f64>> {
    let config = WorkManagerConfig {
        pool_size: Some(4),
        ..WorkManagerConfig::for_backend(kind)
    };
    let mut manager = WorkManager::new(config, RandomWalk::default()).unwrap();
    manager.prepare().unwrap();

    let mut ends = Vec::new();
    for n in 1..=iterations {
        let mut batch = walkers(n, 16);
        manager.prepare_iteration(IterationId(n), &batch).unwrap();
        manager.propagate(&mut batch).unwrap();
        manager.finalize_iteration(IterationId(n), &batch).unwrap();
        ends.push(batch.iter().map(|u| u.result().unwrap().last().unwrap()).collect());
    }
    manager.shutdown(0);
    ends
}

#[test]
fn thread_pool_matches_serial() {
    assert_eq!(
        run_iterations(BackendKind::Serial, 3),
        run_iterations(BackendKind::ThreadPool, 3)
    );
}

#[test]
fn faults_surface_as_propagation_failure() {
    let config = WorkManagerConfig {
        pool_size: Some(2),
        ..WorkManagerConfig::for_backend(BackendKind::ThreadPool)
    };
    let mut manager = WorkManager::new(config, RandomWalk::default()).unwrap();
    manager.prepare().unwrap();

    let inputs = vec![
        WalkInput::new(1, 10),
        WalkInput::new(2, 10).with_fault(Fault::Fail),
        WalkInput::new(3, 10).with_fault(Fault::Panic),
        WalkInput::new(4, 10).with_delay(Duration::from_millis(20)),
    ];
    let mut batch = Batch::from_inputs(IterationId(1), inputs);
    manager.prepare_iteration(IterationId(1), &batch).unwrap();
    match manager.propagate(&mut batch) {
        Err(WorkError::Propagation(failure)) => {
            assert_eq!(failure.failed_ids(), vec![WorkUnitId(1), WorkUnitId(2)]);
            assert_eq!(failure.count(FailureCause::Propagator), 2);
        }
        other => panic!("expected Propagation, got {other:?}"),
    }
    assert_eq!(batch.units()[0].result().unwrap().pcoord.len(), 11);
    assert!(batch.units()[3].result().is_some());
    assert_eq!(manager.propagator().propagated(), 2);
}
