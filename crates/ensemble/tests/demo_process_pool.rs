//! End-to-end process-pool tests driving the real `ensemble-demo` binary.
//!
//! The master relaunches the same executable in worker mode, so these
//! exercise the full path: spawn, framed assignment over stdin/stdout,
//! heartbeats, crash detection, retry, and shutdown.

#![cfg(unix)]

use std::process::{Command, Output};
use std::time::{Duration, Instant};

const DEMO: &str = env!("CARGO_BIN_EXE_ensemble-demo");

fn demo(args: &[&str]) -> Output {
    Command::new(DEMO)
        .args(args)
        .env("RUST_LOG", "error")
        .output()
        .expect("failed to run ensemble-demo")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Per-unit result lines, which must agree across backends.
fn unit_lines(out: &Output) -> Vec<String> {
    stdout(out)
        .lines()
        .filter(|l| l.starts_with("  unit"))
        .map(str::to_string)
        .collect()
}

#[test]
fn process_pool_matches_serial() {
    let common = ["--iterations", "2", "--walkers", "6", "--steps", "30", "--seed", "11"];
    let serial = demo(&[&common[..], &["--backend", "serial"]].concat());
    let pooled = demo(&[&common[..], &["--backend", "processes", "--pool-size", "3"]].concat());
    assert!(serial.status.success(), "{}", String::from_utf8_lossy(&serial.stderr));
    assert!(pooled.status.success(), "{}", String::from_utf8_lossy(&pooled.stderr));
    assert_eq!(unit_lines(&serial).len(), 12);
    assert_eq!(unit_lines(&serial), unit_lines(&pooled));
}

#[test]
fn crashed_unit_is_retried_and_completes() {
    let markers = tempfile::tempdir().unwrap();
    let dir = markers.path().to_str().unwrap();
    // Unit #2 is the third of four walkers.
    let out = demo(&[
        "--backend", "processes", "--pool-size", "2", "--iterations", "1",
        "--walkers", "4", "--crash-once", "2", "--marker-dir", dir,
    ]);
    let text = stdout(&out);
    assert!(out.status.success(), "{text}\n{}", String::from_utf8_lossy(&out.stderr));
    assert!(text.contains("iteration 1: 4 complete, 0 failed"), "{text}");
    assert!(text.contains("unit #2 -> "), "{text}");
    assert!(text.contains("(attempts 2)"), "{text}");
    for other in ["#0", "#1", "#3"] {
        assert!(text.contains(&format!("unit {other} -> ")), "{text}");
    }
    assert!(markers.path().join("crash-once-1-2").exists());
}

#[test]
fn exhausted_retries_fail_only_that_unit() {
    let out = demo(&[
        "--backend", "processes", "--pool-size", "2", "--iterations", "1",
        "--walkers", "4", "--crash", "2", "--max-retries", "1",
    ]);
    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(2), "{text}");
    assert!(text.contains("iteration 1: 3 complete, 1 failed"), "{text}");
    assert!(text.contains("unit #2 failed (worker lost)"), "{text}");
    assert!(text.contains("(attempts 2)"), "{text}");
}

#[test]
fn pool_of_n_beats_serial_time_bound() {
    const N: u64 = 2;
    const T_MS: u64 = 400;
    let start = Instant::now();
    let out = demo(&[
        "--backend", "processes", "--pool-size", &N.to_string(), "--iterations", "1",
        "--walkers", &(2 * N).to_string(), "--delay-ms", &T_MS.to_string(),
    ]);
    let elapsed = start.elapsed();
    assert!(out.status.success());
    assert!(
        elapsed < Duration::from_millis(2 * N * T_MS),
        "2N units took {elapsed:?}"
    );
}

#[test]
fn hung_worker_hits_unit_timeout() {
    let out = demo(&[
        "--backend", "processes", "--pool-size", "2", "--iterations", "1",
        "--walkers", "3", "--hang", "0", "--unit-timeout-ms", "300",
        "--heartbeat-ms", "50", "--max-retries", "0", "--grace-ms", "200",
    ]);
    let text = stdout(&out);
    assert!(text.contains("iteration 1: 2 complete, 1 failed"), "{text}");
    assert!(text.contains("unit #0 failed (worker lost)"), "{text}");
}

#[test]
fn shutdown_during_work_keeps_exit_code() {
    let start = Instant::now();
    let out = demo(&[
        "--backend", "processes", "--pool-size", "2", "--iterations", "3",
        "--walkers", "4", "--delay-ms", "800", "--grace-ms", "3000",
        "--shutdown-after-ms", "300", "--exit-code", "3",
    ]);
    let elapsed = start.elapsed();
    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(3), "{text}");
    assert!(text.contains("iteration 1: 2 complete, 2 failed"), "{text}");
    assert_eq!(text.matches("failed (cancelled)").count(), 2, "{text}");
    assert!(text.contains("shutdown requested during iteration 1"), "{text}");
    assert!(text.contains("shutdown: exit code 3"), "{text}");
    assert!(elapsed < Duration::from_millis(3_000), "took {elapsed:?}");
}

#[test]
fn heartbeat_settings_reach_the_workers() {
    // The workers' own default would be a 1000 ms heartbeat.
    let out = demo(&[
        "--backend", "processes", "--pool-size", "2", "--iterations", "1",
        "--walkers", "4", "--delay-ms", "400", "--max-retries", "0",
        "--set", "heartbeat_interval_ms=50", "--set", "missed_heartbeats=4",
    ]);
    let text = stdout(&out);
    assert!(out.status.success(), "{text}\n{}", String::from_utf8_lossy(&out.stderr));
    assert!(text.contains("iteration 1: 4 complete, 0 failed"), "{text}");
}

#[test]
fn hung_unit_is_killed_after_shutdown_grace() {
    let start = Instant::now();
    let out = demo(&[
        "--backend", "processes", "--pool-size", "2", "--iterations", "3",
        "--walkers", "2", "--hang", "0", "--grace-ms", "300",
        "--shutdown-after-ms", "300", "--exit-code", "4",
    ]);
    let elapsed = start.elapsed();
    let text = stdout(&out);
    assert_eq!(out.status.code(), Some(4), "{text}");
    assert!(text.contains("iteration 1: 1 complete, 1 failed"), "{text}");
    assert!(
        text.contains("unit #0 failed (cancelled): abandoned after shutdown grace period"),
        "{text}"
    );
    assert!(text.contains("killed 1"), "{text}");
    assert!(elapsed < Duration::from_millis(5_000), "took {elapsed:?}");
}

#[test]
fn worker_mode_needs_the_process_backend() {
    let out = demo(&["--mode", "worker", "--backend", "threads"]);
    assert!(!out.status.success());
    let err = String::from_utf8_lossy(&out.stderr);
    assert!(err.contains("worker mode is not supported"), "{err}");
}
