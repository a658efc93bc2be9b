// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use calcflow_environment::{BackoffPolicy, ComputerConfig};
use uuid::Uuid;

/// How the daemon reaches its broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerMode {
    /// Private in-process broker
    #[default]
    Embedded,
    /// In-process broker also served over TCP to other runners and clients
    Serve,
    /// Connect to a broker served by another daemon
    Connect,
}

impl std::str::FromStr for BrokerMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(Self::Embedded),
            "serve" => Ok(Self::Serve),
            "connect" => Ok(Self::Connect),
            _ => Err(()),
        }
    }
}

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Identity recorded as checkpoint owner
    pub runner_id: String,
    /// Local directory for job sandboxes and retrieved files
    pub work_dir: PathBuf,
    /// Maximum number of processes rehydrated at startup
    pub max_rehydrate: usize,
    /// How long shutdown waits for live processes to reach a checkpoint
    pub shutdown_timeout: Duration,
    /// Resumption failures after which a process is forced into Excepted
    pub max_resume_failures: u32,
    /// Timeout for control RPCs issued through the runner
    pub rpc_timeout: Duration,
    /// Backoff and retry budget for transport operations
    pub transport_backoff: BackoffPolicy,
    /// Fresh submission attempts after a scheduler rejection
    pub max_resubmissions: u32,
    /// Interval between scheduler status polls
    pub poll_interval: Duration,
    /// Fraction of the poll interval that is randomized
    pub poll_jitter: f64,
    /// Execution hosts known to this runner
    pub computers: Vec<ComputerConfig>,
    /// Broker topology used by the daemon
    pub broker_mode: BrokerMode,
    /// Checkpoint versions kept once a process is terminal (0 keeps all)
    pub checkpoint_retention: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: format!("runner-{}", Uuid::new_v4().simple()),
            work_dir: PathBuf::from(".data"),
            max_rehydrate: 200,
            shutdown_timeout: Duration::from_millis(30_000),
            max_resume_failures: 3,
            rpc_timeout: Duration::from_millis(10_000),
            transport_backoff: BackoffPolicy::default(),
            max_resubmissions: 3,
            poll_interval: Duration::from_millis(10_000),
            poll_jitter: 0.2,
            computers: Vec::new(),
            broker_mode: BrokerMode::Embedded,
            checkpoint_retention: 1,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    hint: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, hint))
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional (with defaults):
    /// - `CALCFLOW_RUNNER_ID`: runner identity (default: random `runner-<uuid>`)
    /// - `CALCFLOW_WORK_DIR`: local data directory (default: `.data`)
    /// - `CALCFLOW_MAX_REHYDRATE`: processes loaded at startup (default: 200)
    /// - `CALCFLOW_SHUTDOWN_TIMEOUT_MS`: drain timeout (default: 30000)
    /// - `CALCFLOW_MAX_RESUME_FAILURES`: (default: 3)
    /// - `CALCFLOW_RPC_TIMEOUT_MS`: (default: 10000)
    /// - `CALCFLOW_TRANSPORT_MAX_RETRIES`: (default: 5)
    /// - `CALCFLOW_BACKOFF_INITIAL_MS`: (default: 2000)
    /// - `CALCFLOW_BACKOFF_MAX_MS`: (default: 60000)
    /// - `CALCFLOW_MAX_RESUBMISSIONS`: (default: 3)
    /// - `CALCFLOW_POLL_INTERVAL_MS`: (default: 10000)
    /// - `CALCFLOW_POLL_JITTER`: fraction in 0.0..=1.0 (default: 0.2)
    /// - `CALCFLOW_COMPUTERS`: JSON array of computer definitions (default: none)
    /// - `CALCFLOW_BROKER_MODE`: `embedded`, `serve` or `connect` (default: embedded)
    /// - `CALCFLOW_CHECKPOINT_RETENTION`: versions kept after a terminal state, 0 keeps all (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let runner_id = std::env::var("CALCFLOW_RUNNER_ID").unwrap_or(defaults.runner_id);
        if runner_id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "CALCFLOW_RUNNER_ID",
                "must not be empty",
            ));
        }

        let work_dir = std::env::var("CALCFLOW_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);

        let max_rehydrate: usize =
            parse_var("CALCFLOW_MAX_REHYDRATE", "200", "must be a non-negative integer")?;
        let shutdown_ms: u64 = parse_var(
            "CALCFLOW_SHUTDOWN_TIMEOUT_MS",
            "30000",
            "must be a duration in milliseconds",
        )?;
        let max_resume_failures: u32 = parse_var(
            "CALCFLOW_MAX_RESUME_FAILURES",
            "3",
            "must be a non-negative integer",
        )?;
        let rpc_ms: u64 = parse_var(
            "CALCFLOW_RPC_TIMEOUT_MS",
            "10000",
            "must be a duration in milliseconds",
        )?;
        let max_retries: u32 = parse_var(
            "CALCFLOW_TRANSPORT_MAX_RETRIES",
            "5",
            "must be a non-negative integer",
        )?;
        let backoff_initial_ms: u64 = parse_var(
            "CALCFLOW_BACKOFF_INITIAL_MS",
            "2000",
            "must be a duration in milliseconds",
        )?;
        let backoff_max_ms: u64 = parse_var(
            "CALCFLOW_BACKOFF_MAX_MS",
            "60000",
            "must be a duration in milliseconds",
        )?;
        if backoff_max_ms < backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "CALCFLOW_BACKOFF_MAX_MS",
                "must not be smaller than CALCFLOW_BACKOFF_INITIAL_MS",
            ));
        }
        let max_resubmissions: u32 = parse_var(
            "CALCFLOW_MAX_RESUBMISSIONS",
            "3",
            "must be a non-negative integer",
        )?;
        let poll_ms: u64 = parse_var(
            "CALCFLOW_POLL_INTERVAL_MS",
            "10000",
            "must be a duration in milliseconds",
        )?;
        if poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "CALCFLOW_POLL_INTERVAL_MS",
                "must be greater than zero",
            ));
        }
        let poll_jitter: f64 =
            parse_var("CALCFLOW_POLL_JITTER", "0.2", "must be a number in 0.0..=1.0")?;
        if !(0.0..=1.0).contains(&poll_jitter) {
            return Err(ConfigError::Invalid(
                "CALCFLOW_POLL_JITTER",
                "must be a number in 0.0..=1.0",
            ));
        }

        let computers = match std::env::var("CALCFLOW_COMPUTERS") {
            Ok(raw) => serde_json::from_str(&raw).map_err(|_| {
                ConfigError::Invalid(
                    "CALCFLOW_COMPUTERS",
                    "must be a JSON array of computer definitions",
                )
            })?,
            Err(_) => Vec::new(),
        };

        let broker_mode: BrokerMode = parse_var(
            "CALCFLOW_BROKER_MODE",
            "embedded",
            "must be one of embedded, serve, connect",
        )?;
        let checkpoint_retention: usize = parse_var(
            "CALCFLOW_CHECKPOINT_RETENTION",
            "1",
            "must be a non-negative integer",
        )?;

        Ok(Self {
            runner_id,
            work_dir,
            max_rehydrate,
            shutdown_timeout: Duration::from_millis(shutdown_ms),
            max_resume_failures,
            rpc_timeout: Duration::from_millis(rpc_ms),
            transport_backoff: BackoffPolicy::new(
                Duration::from_millis(backoff_initial_ms),
                Duration::from_millis(backoff_max_ms),
                max_retries,
            ),
            max_resubmissions,
            poll_interval: Duration::from_millis(poll_ms),
            poll_jitter,
            computers,
            broker_mode,
            checkpoint_retention,
        })
    }

    pub fn with_runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = runner_id.into();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_max_rehydrate(mut self, max: usize) -> Self {
        self.max_rehydrate = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_resume_failures(mut self, max: u32) -> Self {
        self.max_resume_failures = max;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_transport_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.transport_backoff = policy;
        self
    }

    pub fn with_max_resubmissions(mut self, max: u32) -> Self {
        self.max_resubmissions = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration, jitter: f64) -> Self {
        self.poll_interval = interval;
        self.poll_jitter = jitter;
        self
    }

    pub fn with_checkpoint_retention(mut self, keep: usize) -> Self {
        self.checkpoint_retention = keep;
        self
    }

    pub fn with_computer(mut self, computer: ComputerConfig) -> Self {
        self.computers.push(computer);
        self
    }

    pub fn computer(&self, name: &str) -> Option<&ComputerConfig> {
        self.computers.iter().find(|c| c.name == name)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
