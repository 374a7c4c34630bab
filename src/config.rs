use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::error::ProcessError;

pub const BINARY_ENV: &str = "NEAR_SANDBOX_BIN_PATH";
pub const HOME_ENV: &str = "NEAR_TESTBED_HOME";
pub const PORT_ENV: &str = "NEAR_TESTBED_PORT";
pub const STARTUP_TIMEOUT_ENV: &str = "NEAR_TESTBED_STARTUP_TIMEOUT_SECS";

const DEFAULT_BINARY: &str = "near-sandbox";

/// Settings for one sandbox session.
///
/// Every field has a default; [`SandboxConfig::from_env`] layers the process environment
/// on top of them and the `with_*` setters override individual values.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Path to the sandbox executable.
    pub binary: PathBuf,
    /// Home directory holding the simulator state. A temporary directory is created
    /// and removed with the session when unset.
    pub home_dir: Option<PathBuf>,
    /// RPC port to bind. A free port is allocated when unset.
    pub rpc_port: Option<u16>,
    /// Budget for one launch: `init` on a fresh home, spawning and readiness together.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub startup_timeout: Duration,
    /// Time between the graceful termination signal and the force kill.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stop_grace_period: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Upper bound for a whole blocking operation, retries included. Snapshots, restores
    /// and resets relaunch the sandbox and are bounded by `startup_timeout` instead.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub operation_timeout: Duration,
    pub retry_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_initial_interval: Duration,
    pub worker_threads: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_BINARY),
            home_dir: None,
            rpc_port: None,
            startup_timeout: Duration::from_secs(30),
            stop_grace_period: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(60),
            retry_attempts: 5,
            retry_initial_interval: Duration::from_millis(100),
            worker_threads: 2,
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by `NEAR_SANDBOX_BIN_PATH`, `NEAR_TESTBED_HOME`,
    /// `NEAR_TESTBED_PORT` and `NEAR_TESTBED_STARTUP_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ProcessError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ProcessError> {
        let mut config = Self::default();
        if let Some(binary) = lookup(BINARY_ENV).filter(|v| !v.is_empty()) {
            config.binary = PathBuf::from(binary);
        }
        if let Some(home) = lookup(HOME_ENV).filter(|v| !v.is_empty()) {
            config.home_dir = Some(PathBuf::from(home));
        }
        if let Some(port) = lookup(PORT_ENV).filter(|v| !v.is_empty()) {
            let port = port.parse::<u16>().map_err(|err| ProcessError::InvalidConfig {
                key: PORT_ENV,
                reason: err.to_string(),
            })?;
            config.rpc_port = Some(port);
        }
        if let Some(secs) = lookup(STARTUP_TIMEOUT_ENV).filter(|v| !v.is_empty()) {
            let secs = secs.parse::<u64>().map_err(|err| ProcessError::InvalidConfig {
                key: STARTUP_TIMEOUT_ENV,
                reason: err.to_string(),
            })?;
            config.startup_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home_dir.into());
        self
    }

    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.rpc_port = Some(port);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, attempts: u32, initial_interval: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_initial_interval = initial_interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ProcessError> {
        if self.retry_attempts == 0 {
            return Err(ProcessError::InvalidConfig {
                key: "retry_attempts",
                reason: "at least one attempt is required".to_string(),
            });
        }
        if self.worker_threads == 0 {
            return Err(ProcessError::InvalidConfig {
                key: "worker_threads",
                reason: "the session runtime needs a worker thread".to_string(),
            });
        }
        if self.startup_timeout.is_zero() {
            return Err(ProcessError::InvalidConfig {
                key: "startup_timeout",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
