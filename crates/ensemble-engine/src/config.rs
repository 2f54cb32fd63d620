//! Work manager configuration, validation, and error types.
//!
//! [`WorkManagerConfig`] is passed to
//! [`WorkManager::new`](crate::manager::WorkManager::new); there is no
//! ambient global mode. It can be built in code, deserialized with serde
//! from any runtime configuration source, or parsed from `key=value`
//! settings with [`from_settings`](WorkManagerConfig::from_settings).
//! [`validate()`](WorkManagerConfig::validate) checks structural
//! invariants before any resource is acquired.

use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;

use ensemble_core::WorkUnitId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound applied by [`WorkManagerConfig::resolved_pool_size`].
pub const MAX_POOL_SIZE: usize = 256;

/// Environment variable carrying the master's heartbeat interval, in
/// milliseconds, to every worker process the pool launches.
pub const HEARTBEAT_ENV: &str = "ENSEMBLE_HEARTBEAT_INTERVAL_MS";

// ── Mode ───────────────────────────────────────────────────────────

/// Role of a work manager instance. Fixed at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Runs the iteration loop and dispatches work.
    #[default]
    Master,
    /// Dedicated worker process serving a master's process pool.
    Worker,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Master => "master",
            Self::Worker => "worker",
        })
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            _ => Err(ConfigError::UnknownMode {
                value: s.to_string(),
            }),
        }
    }
}

// ── BackendKind ────────────────────────────────────────────────────

/// Which execution backend a work manager drives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Units run one at a time in the calling thread.
    #[default]
    #[serde(rename = "serial")]
    Serial,
    /// Units run on a pool of threads in this process.
    #[serde(rename = "threads", alias = "thread_pool")]
    ThreadPool,
    /// Units run in dedicated worker processes.
    #[serde(rename = "processes", alias = "process_pool")]
    ProcessPool,
}

impl BackendKind {
    /// Name used in configuration and log output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::ThreadPool => "threads",
            Self::ProcessPool => "processes",
        }
    }

    /// `true` if the backend can host dedicated worker processes, i.e.
    /// a manager in [`Mode::Worker`] can run on it.
    pub fn supports_dedicated_workers(self) -> bool {
        matches!(self, Self::ProcessPool)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "threads" | "thread_pool" => Ok(Self::ThreadPool),
            "processes" | "process_pool" => Ok(Self::ProcessPool),
            _ => Err(ConfigError::UnknownBackend {
                value: s.to_string(),
            }),
        }
    }
}

// ── WorkerCommand ──────────────────────────────────────────────────

/// How a process pool launches its worker processes.
///
/// The program must run a work manager in [`Mode::Worker`] on the process
/// pool backend and call `run_worker()`. Its stdin and stdout carry the
/// master/worker protocol; stderr is inherited for logs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Executable to launch.
    pub program: PathBuf,
    /// Arguments passed to every worker.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables set for every worker.
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Command for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Build a [`Command`] with program, arguments and environment set.
    /// Stdio is left to the caller.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected while building or validating a [`WorkManagerConfig`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `mode` is not `master` or `worker`.
    #[error("unknown mode '{value}' (expected master or worker)")]
    UnknownMode {
        /// The rejected value.
        value: String,
    },
    /// `backend` is not a known backend name.
    #[error("unknown backend '{value}' (expected serial, threads or processes)")]
    UnknownBackend {
        /// The rejected value.
        value: String,
    },
    /// Worker mode was requested on a backend without dedicated workers.
    #[error("worker mode is not supported by the {backend} backend")]
    WorkerModeUnsupported {
        /// The configured backend.
        backend: BackendKind,
    },
    /// `pool_size` is zero.
    #[error("pool_size must be at least 1")]
    PoolSizeZero,
    /// `queue_depth` is zero.
    #[error("queue_depth must be at least 1")]
    QueueDepthZero,
    /// `heartbeat_interval_ms` is zero.
    #[error("heartbeat_interval_ms must be at least 1")]
    HeartbeatIntervalZero,
    /// `missed_heartbeats` is zero.
    #[error("missed_heartbeats must be at least 1")]
    MissedHeartbeatsZero,
    /// `unit_timeout_ms` is zero.
    #[error("unit_timeout_ms must be at least 1 when set")]
    UnitTimeoutZero,
    /// A master-mode process pool has no worker command to launch.
    #[error("the processes backend needs a worker_command in master mode")]
    MissingWorkerCommand,
    /// A `key=value` setting could not be parsed.
    #[error("invalid value '{value}' for setting '{key}': {reason}")]
    InvalidSetting {
        /// Setting name.
        key: String,
        /// The rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A `key=value` setting has an unknown key.
    #[error("unknown setting '{key}'")]
    UnknownSetting {
        /// The unrecognized key.
        key: String,
    },
    /// `prepare_with` was given a config that changes the fixed mode or
    /// backend of an existing manager.
    #[error("cannot change {field} from {from} to {to} after construction")]
    Immutable {
        /// Which field changed.
        field: &'static str,
        /// Value the manager was built with.
        from: String,
        /// Value requested.
        to: String,
    },
    /// A unit's input could not be encoded for a worker process.
    #[error("input of unit {id} cannot be sent to a worker process: {reason}")]
    PayloadNotSerializable {
        /// The offending unit.
        id: WorkUnitId,
        /// Encoder error.
        reason: String,
    },
}

// ── WorkManagerConfig ──────────────────────────────────────────────

/// Complete configuration for a work manager.
///
/// Every field has a documented default; missing fields in a
/// deserialized config take their default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkManagerConfig {
    /// Role of this instance. Default: [`Mode::Master`].
    pub mode: Mode,
    /// Execution backend. Default: [`BackendKind::Serial`].
    pub backend: BackendKind,
    /// Number of pool threads or worker processes. `None` = available
    /// parallelism. Ignored by the serial backend.
    pub pool_size: Option<usize>,
    /// How long `shutdown` waits for in-flight units before reclaiming
    /// workers. Default: 5000.
    pub grace_period_ms: u64,
    /// Times a unit is retried after losing its worker process before it
    /// fails with `WorkerLost`. Default: 2.
    pub max_retries: u32,
    /// Interval between worker heartbeats. Default: 1000.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat intervals a worker may stay silent before it is treated
    /// as lost. Default: 5.
    pub missed_heartbeats: u32,
    /// Optional wall-clock limit for a single unit in a worker process.
    /// Default: `None` (no limit).
    pub unit_timeout_ms: Option<u64>,
    /// Capacity of the thread pool's dispatch queue. `None` = four times
    /// the pool size.
    pub queue_depth: Option<usize>,
    /// Worker launch command. Required for the processes backend in
    /// master mode.
    pub worker_command: Option<WorkerCommand>,
}

impl Default for WorkManagerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Master,
            backend: BackendKind::Serial,
            pool_size: None,
            grace_period_ms: 5000,
            max_retries: 2,
            heartbeat_interval_ms: 1000,
            missed_heartbeats: 5,
            unit_timeout_ms: None,
            queue_depth: None,
            worker_command: None,
        }
    }
}

impl WorkManagerConfig {
    /// Default configuration for `backend`.
    pub fn for_backend(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// Validate all structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 1. Worker mode needs a backend with dedicated workers.
        if self.mode == Mode::Worker && !self.backend.supports_dedicated_workers() {
            return Err(ConfigError::WorkerModeUnsupported {
                backend: self.backend,
            });
        }
        // 2. Sizes, when given, must be positive.
        if self.pool_size == Some(0) {
            return Err(ConfigError::PoolSizeZero);
        }
        if self.queue_depth == Some(0) {
            return Err(ConfigError::QueueDepthZero);
        }
        // 3. Liveness parameters.
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::HeartbeatIntervalZero);
        }
        if self.missed_heartbeats == 0 {
            return Err(ConfigError::MissedHeartbeatsZero);
        }
        if self.unit_timeout_ms == Some(0) {
            return Err(ConfigError::UnitTimeoutZero);
        }
        // 4. A master process pool needs something to launch.
        if self.mode == Mode::Master
            && self.backend == BackendKind::ProcessPool
            && self.worker_command.is_none()
        {
            return Err(ConfigError::MissingWorkerCommand);
        }
        Ok(())
    }

    /// Resolve the pool size, applying auto-detection if `None`.
    ///
    /// Explicit values are clamped to `[1, 256]`.
    pub fn resolved_pool_size(&self) -> usize {
        match self.pool_size {
            Some(n) => n.clamp(1, MAX_POOL_SIZE),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .clamp(1, MAX_POOL_SIZE),
        }
    }

    /// Resolve the thread pool queue capacity.
    pub fn resolved_queue_depth(&self) -> usize {
        self.queue_depth
            .unwrap_or_else(|| self.resolved_pool_size() * 4)
            .max(1)
    }

    /// Grace period as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat interval for a pooled worker. The master's value
    /// (`inherited`, read from [`HEARTBEAT_ENV`]) wins when it is a
    /// positive number of milliseconds; otherwise this config's own.
    pub fn worker_heartbeat_interval(&self, inherited: Option<&str>) -> Duration {
        inherited
            .and_then(|ms| ms.trim().parse::<u64>().ok())
            .filter(|&ms| ms > 0)
            .map_or_else(|| self.heartbeat_interval(), Duration::from_millis)
    }

    /// Silence after which a worker is treated as lost:
    /// `heartbeat_interval × missed_heartbeats`.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval()
            .saturating_mul(self.missed_heartbeats.max(1))
    }

    /// Per-unit timeout as a [`Duration`], if configured.
    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_ms.map(Duration::from_millis)
    }

    /// Build a config from `key=value` runtime settings, starting from
    /// the defaults. Later keys override earlier ones.
    ///
    /// Recognized keys: `mode`, `backend`, `pool_size`, `grace_period_ms`,
    /// `max_retries`, `heartbeat_interval_ms`, `missed_heartbeats`,
    /// `unit_timeout_ms`, `queue_depth`, `worker_program`, `worker_args`
    /// (whitespace-separated). Empty `pool_size`, `unit_timeout_ms` and
    /// `queue_depth` values reset to `None`.
    ///
    /// The result is not validated; call [`validate`](Self::validate).
    pub fn from_settings<K, V>(
        settings: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = Self::default();
        for (key, value) in settings {
            cfg.apply_setting(key.as_ref().trim(), value.as_ref().trim())?;
        }
        Ok(cfg)
    }

    /// Apply one `key=value` setting to this config.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "mode" => self.mode = value.parse()?,
            "backend" => self.backend = value.parse()?,
            "pool_size" => self.pool_size = parse_optional(key, value)?,
            "grace_period_ms" => self.grace_period_ms = parse_number(key, value)?,
            "max_retries" => self.max_retries = parse_number(key, value)?,
            "heartbeat_interval_ms" => self.heartbeat_interval_ms = parse_number(key, value)?,
            "missed_heartbeats" => self.missed_heartbeats = parse_number(key, value)?,
            "unit_timeout_ms" => self.unit_timeout_ms = parse_optional(key, value)?,
            "queue_depth" => self.queue_depth = parse_optional(key, value)?,
            "worker_program" => {
                if value.is_empty() {
                    self.worker_command = None;
                } else {
                    let cmd = self.worker_command.get_or_insert_with(WorkerCommand::default);
                    cmd.program = PathBuf::from(value);
                }
            }
            "worker_args" => {
                let cmd = self.worker_command.get_or_insert_with(WorkerCommand::default);
                cmd.args = value.split_whitespace().map(str::to_string).collect();
            }
            _ => {
                return Err(ConfigError::UnknownSetting {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_optional<T>(key: &str, value: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    if value.is_empty() {
        Ok(None)
    } else {
        parse_number(key, value).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_config() -> WorkManagerConfig {
        WorkManagerConfig {
            backend: BackendKind::ProcessPool,
            worker_command: Some(WorkerCommand::new("/bin/true")),
            ..WorkManagerConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(WorkManagerConfig::default().validate().is_ok());
        assert!(process_config().validate().is_ok());
    }

    #[test]
    fn worker_mode_on_threads_fails() {
        let cfg = WorkManagerConfig {
            mode: Mode::Worker,
            backend: BackendKind::ThreadPool,
            ..WorkManagerConfig::default()
        };
        match cfg.validate() {
            Err(ConfigError::WorkerModeUnsupported {
                backend: BackendKind::ThreadPool,
            }) => {}
            other => panic!("expected WorkerModeUnsupported, got {other:?}"),
        }
    }

    #[test]
    fn worker_mode_on_processes_needs_no_command() {
        let cfg = WorkManagerConfig {
            mode: Mode::Worker,
            backend: BackendKind::ProcessPool,
            ..WorkManagerConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn master_process_pool_without_command_fails() {
        let mut cfg = process_config();
        cfg.worker_command = None;
        match cfg.validate() {
            Err(ConfigError::MissingWorkerCommand) => {}
            other => panic!("expected MissingWorkerCommand, got {other:?}"),
        }
    }

    #[test]
    fn zero_values_fail() {
        let cases: [(WorkManagerConfig, ConfigError); 5] = [
            (
                WorkManagerConfig {
                    pool_size: Some(0),
                    ..WorkManagerConfig::default()
                },
                ConfigError::PoolSizeZero,
            ),
            (
                WorkManagerConfig {
                    queue_depth: Some(0),
                    ..WorkManagerConfig::default()
                },
                ConfigError::QueueDepthZero,
            ),
            (
                WorkManagerConfig {
                    heartbeat_interval_ms: 0,
                    ..WorkManagerConfig::default()
                },
                ConfigError::HeartbeatIntervalZero,
            ),
            (
                WorkManagerConfig {
                    missed_heartbeats: 0,
                    ..WorkManagerConfig::default()
                },
                ConfigError::MissedHeartbeatsZero,
            ),
            (
                WorkManagerConfig {
                    unit_timeout_ms: Some(0),
                    ..WorkManagerConfig::default()
                },
                ConfigError::UnitTimeoutZero,
            ),
        ];
        for (cfg, expected) in cases {
            assert_eq!(cfg.validate(), Err(expected));
        }
    }

    #[test]
    fn resolved_pool_size_clamps() {
        let mut cfg = WorkManagerConfig::default();
        cfg.pool_size = Some(0);
        assert_eq!(cfg.resolved_pool_size(), 1);
        cfg.pool_size = Some(10_000);
        assert_eq!(cfg.resolved_pool_size(), MAX_POOL_SIZE);
        cfg.pool_size = None;
        let auto = cfg.resolved_pool_size();
        assert!((1..=MAX_POOL_SIZE).contains(&auto), "auto size {auto}");
    }

    #[test]
    fn queue_depth_defaults_to_four_per_worker() {
        let cfg = WorkManagerConfig {
            pool_size: Some(3),
            ..WorkManagerConfig::default()
        };
        assert_eq!(cfg.resolved_queue_depth(), 12);
    }

    #[test]
    fn heartbeat_timeout_multiplies_interval() {
        let cfg = WorkManagerConfig {
            heartbeat_interval_ms: 200,
            missed_heartbeats: 3,
            ..WorkManagerConfig::default()
        };
        assert_eq!(cfg.heartbeat_timeout(), Duration::from_millis(600));
    }

    #[test]
    fn worker_takes_the_masters_heartbeat() {
        let cfg = WorkManagerConfig {
            heartbeat_interval_ms: 1000,
            ..WorkManagerConfig::default()
        };
        assert_eq!(cfg.worker_heartbeat_interval(Some("50")), Duration::from_millis(50));
        assert_eq!(cfg.worker_heartbeat_interval(Some(" 75\n")), Duration::from_millis(75));
        for ignored in [None, Some(""), Some("0"), Some("fast")] {
            assert_eq!(cfg.worker_heartbeat_interval(ignored), Duration::from_secs(1));
        }
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("serial".parse::<BackendKind>(), Ok(BackendKind::Serial));
        assert_eq!("Threads".parse::<BackendKind>(), Ok(BackendKind::ThreadPool));
        assert_eq!(
            "process_pool".parse::<BackendKind>(),
            Ok(BackendKind::ProcessPool)
        );
        match "mpi".parse::<BackendKind>() {
            Err(ConfigError::UnknownBackend { value }) => assert_eq!(value, "mpi"),
            other => panic!("expected UnknownBackend, got {other:?}"),
        }
        assert_eq!(" worker ".parse::<Mode>(), Ok(Mode::Worker));
    }

    #[test]
    fn settings_override_defaults() {
        let cfg = WorkManagerConfig::from_settings([
            ("backend", "processes"),
            ("pool_size", "3"),
            ("max_retries", "0"),
            ("unit_timeout_ms", "250"),
            ("worker_program", "/usr/bin/ensemble-demo"),
            ("worker_args", "--mode worker  --backend processes"),
        ])
        .unwrap();
        assert_eq!(cfg.backend, BackendKind::ProcessPool);
        assert_eq!(cfg.pool_size, Some(3));
        assert_eq!(cfg.max_retries, 0);
        assert_eq!(cfg.unit_timeout(), Some(Duration::from_millis(250)));
        let cmd = cfg.worker_command.as_ref().unwrap();
        assert_eq!(cmd.program, PathBuf::from("/usr/bin/ensemble-demo"));
        assert_eq!(cmd.args, ["--mode", "worker", "--backend", "processes"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_settings_are_rejected() {
        match WorkManagerConfig::from_settings([("pool_size", "many")]) {
            Err(ConfigError::InvalidSetting { key, .. }) => assert_eq!(key, "pool_size"),
            other => panic!("expected InvalidSetting, got {other:?}"),
        }
        match WorkManagerConfig::from_settings([("colour", "blue")]) {
            Err(ConfigError::UnknownSetting { key }) => assert_eq!(key, "colour"),
            other => panic!("expected UnknownSetting, got {other:?}"),
        }
    }

    #[test]
    fn empty_optional_setting_resets() {
        let cfg =
            WorkManagerConfig::from_settings([("pool_size", "8"), ("pool_size", "")]).unwrap();
        assert_eq!(cfg.pool_size, None);
    }

    #[test]
    fn config_survives_serde() {
        let cfg = WorkManagerConfig {
            backend: BackendKind::ThreadPool,
            pool_size: Some(2),
            ..WorkManagerConfig::default()
        };
        let bytes = rmp_serde::to_vec_named(&cfg).unwrap();
        let back: WorkManagerConfig = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn worker_command_builder_collects_args_and_env() {
        let cmd = WorkerCommand::new("worker")
            .arg("--mode")
            .args(["worker", "--verbose"])
            .env("RUST_LOG", "debug");
        assert_eq!(cmd.args, ["--mode", "worker", "--verbose"]);
        assert_eq!(cmd.env, [("RUST_LOG".to_string(), "debug".to_string())]);
        let built = cmd.to_command();
        assert_eq!(built.get_program(), "worker");
        assert_eq!(built.get_args().count(), 3);
    }
}
