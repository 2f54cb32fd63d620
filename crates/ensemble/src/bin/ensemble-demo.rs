//! ensemble-demo: a random-walk simulation driver and worker.
//!
//! In master mode it runs `--iterations` iterations of `--walkers` seeded
//! random walkers on the chosen backend and prints one summary line per
//! iteration plus one line per unit. With `--backend processes` it
//! launches copies of itself in worker mode as the pool's workers.
//!
//! Logs go to stderr (`RUST_LOG` controls the level) so a worker's stdout
//! stays a clean protocol channel.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use ensemble::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status when some units failed but the run completed.
const EXIT_UNIT_FAILURES: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "ensemble-demo", version, about = "Random-walk ensemble driver", long_about = None)]
struct Cli {
    /// master drives iterations; worker serves a master over stdin/stdout
    #[arg(long, default_value = "master")]
    mode: Mode,

    /// Execution backend: serial, threads or processes
    #[arg(long, default_value = "serial")]
    backend: BackendKind,

    /// Worker threads or processes (default: available parallelism)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Iterations to run
    #[arg(long, default_value_t = 3)]
    iterations: u64,

    /// Walkers (work units) per iteration
    #[arg(long, default_value_t = 8)]
    walkers: u64,

    /// Steps per walker
    #[arg(long, default_value_t = 20)]
    steps: u32,

    /// Base RNG seed
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Extra time each walker spends, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Constant drift added to every step
    #[arg(long, default_value_t = 0.0)]
    drift: f64,

    /// Worker heartbeat interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Heartbeats a worker may miss before it is considered lost
    #[arg(long, default_value_t = 5)]
    missed_heartbeats: u32,

    /// Per-unit time limit in milliseconds (process pool)
    #[arg(long)]
    unit_timeout_ms: Option<u64>,

    /// Shutdown grace period in milliseconds
    #[arg(long, default_value_t = 5000)]
    grace_ms: u64,

    /// Retries for a unit whose worker process was lost
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Extra `key=value` work manager settings, applied last
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_setting)]
    settings: Vec<(String, String)>,

    /// Unit ids that fail with a propagator error
    #[arg(long = "fail", value_name = "UNIT")]
    fail_units: Vec<u64>,

    /// Unit ids whose worker process aborts on every attempt
    #[arg(long = "crash", value_name = "UNIT")]
    crash_units: Vec<u64>,

    /// Unit ids whose worker process aborts on the first attempt only
    #[arg(long = "crash-once", value_name = "UNIT", requires = "marker_dir")]
    crash_once_units: Vec<u64>,

    /// Unit ids that never return
    #[arg(long = "hang", value_name = "UNIT")]
    hang_units: Vec<u64>,

    /// Directory for crash-once marker files
    #[arg(long)]
    marker_dir: Option<PathBuf>,

    /// Request shutdown this many milliseconds after the first iteration starts
    #[arg(long)]
    shutdown_after_ms: Option<u64>,

    /// Exit code to request with --shutdown-after-ms or at the end of the run
    #[arg(long, default_value_t = 0)]
    exit_code: i32,
}

fn parse_setting(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.mode {
        Mode::Master => run_master(&cli),
        Mode::Worker => run_worker(&cli),
    };
    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            error!(error = %e, "ensemble-demo failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_config(cli: &Cli) -> Result<WorkManagerConfig, WorkError> {
    let mut config = WorkManagerConfig {
        mode: cli.mode,
        backend: cli.backend,
        pool_size: cli.pool_size,
        grace_period_ms: cli.grace_ms,
        max_retries: cli.max_retries,
        heartbeat_interval_ms: cli.heartbeat_ms,
        missed_heartbeats: cli.missed_heartbeats,
        unit_timeout_ms: cli.unit_timeout_ms,
        ..WorkManagerConfig::default()
    };
    for (key, value) in &cli.settings {
        config.apply_setting(key, value)?;
    }
    if config.mode == Mode::Master
        && config.backend == BackendKind::ProcessPool
        && config.worker_command.is_none()
    {
        config.worker_command = Some(self_as_worker(cli, &config)?);
    }
    Ok(config)
}

/// This executable, relaunched as a process-pool worker. The pool passes
/// its heartbeat interval to the worker itself.
fn self_as_worker(cli: &Cli, config: &WorkManagerConfig) -> Result<WorkerCommand, WorkError> {
    let exe = env::current_exe().map_err(|e| {
        WorkError::Configuration(ConfigError::InvalidSetting {
            key: "worker_program".to_string(),
            value: String::new(),
            reason: format!("cannot locate this executable: {e}"),
        })
    })?;
    let drift = cli.drift.to_string();
    let heartbeat = config.heartbeat_interval_ms.to_string();
    Ok(WorkerCommand::new(exe).args([
        "--mode",
        "worker",
        "--backend",
        "processes",
        "--drift",
        drift.as_str(),
        "--heartbeat-ms",
        heartbeat.as_str(),
    ]))
}

fn build_walk(cli: &Cli) -> Result<RandomWalk, WorkError> {
    RandomWalk::builder().drift(cli.drift).build().map_err(|reason| {
        WorkError::Configuration(ConfigError::InvalidSetting {
            key: "drift".to_string(),
            value: cli.drift.to_string(),
            reason,
        })
    })
}

fn run_worker(cli: &Cli) -> Result<i32, WorkError> {
    let mut manager = WorkManager::new(build_config(cli)?, build_walk(cli)?)?;
    manager.prepare()?;
    let result = manager.run_worker();
    manager.shutdown(0);
    result.map(|()| 0)
}

/// Which fault, if any, the demo flags inject into a unit.
struct Faults {
    fail: HashSet<u64>,
    crash: HashSet<u64>,
    crash_once: HashSet<u64>,
    hang: HashSet<u64>,
    marker_dir: Option<PathBuf>,
}

impl Faults {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            fail: cli.fail_units.iter().copied().collect(),
            crash: cli.crash_units.iter().copied().collect(),
            crash_once: cli.crash_once_units.iter().copied().collect(),
            hang: cli.hang_units.iter().copied().collect(),
            marker_dir: cli.marker_dir.clone(),
        }
    }

    fn for_unit(&self, iteration: u64, unit: u64) -> Fault {
        if self.fail.contains(&unit) {
            Fault::Fail
        } else if self.crash.contains(&unit) {
            Fault::Crash
        } else if self.hang.contains(&unit) {
            Fault::Hang
        } else if let (true, Some(dir)) = (self.crash_once.contains(&unit), &self.marker_dir) {
            Fault::CrashOnce {
                marker: dir.join(format!("crash-once-{iteration}-{unit}")),
            }
        } else {
            Fault::None
        }
    }
}

fn inputs(cli: &Cli, faults: &Faults, iteration: u64) -> Vec<WalkInput> {
    (0..cli.walkers)
        .map(|unit| {
            let seed = cli
                .seed
                .wrapping_mul(1_000_003)
                .wrapping_add(iteration.wrapping_mul(100_003))
                .wrapping_add(unit);
            WalkInput::new(seed, cli.steps)
                .with_delay(Duration::from_millis(cli.delay_ms))
                .with_fault(faults.for_unit(iteration, unit))
        })
        .collect()
}

fn run_master(cli: &Cli) -> Result<i32, WorkError> {
    let mut manager = WorkManager::new(build_config(cli)?, build_walk(cli)?)?;
    manager.prepare()?;
    let faults = Faults::from_cli(cli);

    if let Some(ms) = cli.shutdown_after_ms {
        let handle = manager.shutdown_handle();
        let code = cli.exit_code;
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(ms));
            info!(exit_code = code, "requesting shutdown");
            handle.request(code);
        });
    }

    let started = Instant::now();
    let mut had_failures = false;
    for n in 1..=cli.iterations {
        let iteration = IterationId(n);
        let mut batch = Batch::from_inputs(iteration, inputs(cli, &faults, n));
        match manager.prepare_iteration(iteration, &batch) {
            Ok(()) => {}
            Err(WorkError::InvalidState { .. }) if manager.state() == ManagerState::ShuttingDown => {
                println!("shutdown requested before iteration {n}");
                break;
            }
            Err(e) => {
                manager.shutdown(1);
                return Err(e);
            }
        }
        match manager.propagate(&mut batch) {
            Ok(()) => {}
            Err(WorkError::Propagation(failure)) => {
                warn!(%failure, "iteration finished with failed units");
                had_failures = true;
            }
            Err(e) => {
                manager.shutdown(1);
                return Err(e);
            }
        }
        report_iteration(&batch);

        if manager.state() == ManagerState::ShuttingDown {
            println!("shutdown requested during iteration {n}");
            break;
        }
        manager.finalize_iteration(iteration, &batch)?;
    }

    let requested = if had_failures && cli.exit_code == 0 {
        EXIT_UNIT_FAILURES
    } else {
        cli.exit_code
    };
    let report = manager.shutdown(requested);
    println!(
        "shutdown: exit code {}, joined {}, abandoned {}, killed {}",
        report.exit_code, report.workers_joined, report.workers_abandoned, report.workers_killed
    );
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "run finished"
    );
    Ok(report.exit_code)
}

fn report_iteration(batch: &Batch<WalkInput, WalkOutput>) {
    let failed = batch.failed().count();
    let complete = batch.len() - failed;
    let iteration = batch.iter().next().map_or(0, |u| u.iteration().0);
    println!("iteration {iteration}: {complete} complete, {failed} failed");
    for unit in batch.iter() {
        match (unit.result(), unit.failure()) {
            (Some(out), _) => println!(
                "  unit {} -> {:.9} (attempts {})",
                unit.id(),
                out.last().unwrap_or(f64::NAN),
                unit.attempts()
            ),
            (None, Some(f)) => println!(
                "  unit {} failed ({}): {} (attempts {})",
                unit.id(),
                f.cause,
                f.reason,
                unit.attempts()
            ),
            (None, None) => println!("  unit {} unresolved", unit.id()),
        }
    }
}
