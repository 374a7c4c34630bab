//! Lifecycle of the sandbox process.
//!
//! One [`Supervisor`] launches and stops the simulator behind one [`SimulatorHandle`]:
//! it picks ports, prepares the home directory, initialises genesis on first use,
//! waits for the RPC endpoint to answer and tears the process group down again.

use std::{
    fmt,
    fs::{self, OpenOptions},
    net::TcpListener,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use backoff::{ExponentialBackoffBuilder, backoff::Backoff};
use derive_more::Display;
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use rand::RngCore;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tempfile::TempDir;
use tokio::{
    process::{Child, Command},
    time::Instant,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::SandboxConfig,
    error::{ApplicationError, ProcessError},
    rpc::{RetryPolicy, RpcClient},
    transaction::KeyPair,
    types::AccountId,
};

const LOG_FILE: &str = "sandbox.log";
const VALIDATOR_KEY_FILE: &str = "validator_key.json";
const NODE_KEY_FILE: &str = "node_key.json";
pub(crate) const DATA_DIR: &str = "data";
const LOG_TAIL_LINES: usize = 20;
const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LifecycleState {
    NotStarted,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

/// Random identity of one simulator instance. Checkpoints remember it so they can only
/// be restored into the instance that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub struct HandleId(String);

impl HandleId {
    fn random() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }
}

enum Home {
    Owned(TempDir),
    Pinned(PathBuf),
}

impl Home {
    fn path(&self) -> &Path {
        match self {
            Self::Owned(dir) => dir.path(),
            Self::Pinned(path) => path,
        }
    }
}

/// One simulator instance, either launched by a [`Supervisor`] or attached to a
/// process managed elsewhere.
pub struct SimulatorHandle {
    id: HandleId,
    endpoint: Url,
    rpc_port: u16,
    net_port: u16,
    home: Option<Home>,
    child: Option<Child>,
    state: LifecycleState,
}

impl SimulatorHandle {
    /// Wraps a simulator that is already running at `endpoint`. It is never stopped by
    /// this crate and does not support checkpoints.
    pub fn attached(endpoint: Url) -> Self {
        let rpc_port = endpoint.port_or_known_default().unwrap_or_default();
        Self {
            id: HandleId::random(),
            endpoint,
            rpc_port,
            net_port: 0,
            home: None,
            child: None,
            state: LifecycleState::Ready,
        }
    }

    /// A handle with a home directory but no process, for exercising state handling.
    #[cfg(test)]
    pub(crate) fn with_home(endpoint: Url, home: PathBuf) -> Self {
        let mut handle = Self::attached(endpoint);
        handle.home = Some(Home::Pinned(home));
        handle
    }

    pub fn id(&self) -> &HandleId {
        &self.id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: LifecycleState) {
        self.state = state;
    }

    pub fn home_dir(&self) -> Option<&Path> {
        self.home.as_ref().map(Home::path)
    }

    pub fn is_attached(&self) -> bool {
        self.home.is_none()
    }

    /// OS process id of the running simulator.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        self.home_dir().map(|home| home.join(LOG_FILE))
    }

    fn require_home(&self) -> Result<&Path, ProcessError> {
        self.home_dir().ok_or(ProcessError::NotReady { state: self.state })
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }

    fn signal_group(&self, signal: Signal) {
        let Some(pid) = self.pid() else { return };
        if let Err(err) = killpg(Pid::from_raw(pid as i32), signal) {
            debug!(pid, ?signal, %err, "Signalling sandbox process group failed");
        }
    }
}

impl fmt::Debug for SimulatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatorHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.as_str())
            .field("home", &self.home_dir())
            .field("pid", &self.pid())
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.signal_group(Signal::SIGKILL);
        }
    }
}

#[derive(Deserialize)]
struct NodeKeyFile {
    public_key: String,
}

#[derive(Deserialize)]
struct ValidatorKeyFile {
    account_id: AccountId,
    #[serde(alias = "private_key")]
    secret_key: String,
}

/// Launches, watches and stops sandbox processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SandboxConfig,
}

impl Supervisor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Starts a fresh simulator and waits until its RPC endpoint answers.
    pub async fn start(&self) -> Result<SimulatorHandle, ProcessError> {
        self.config.validate()?;

        let rpc_port = match self.config.rpc_port {
            Some(port) => {
                ensure_port_free(port)?;
                port
            }
            None => free_port()?,
        };
        let net_port = free_port()?;

        let home = match &self.config.home_dir {
            Some(path) => {
                fs::create_dir_all(path).map_err(|source| ProcessError::HomeDir {
                    path: path.clone(),
                    source,
                })?;
                Home::Pinned(path.clone())
            }
            None => Home::Owned(tempfile::Builder::new().prefix("near-testbed-").tempdir().map_err(
                |source| ProcessError::HomeDir {
                    path: std::env::temp_dir(),
                    source,
                },
            )?),
        };

        let endpoint = Url::parse(&format!("http://127.0.0.1:{rpc_port}")).map_err(|err| {
            ProcessError::InvalidConfig {
                key: "rpc_port",
                reason: err.to_string(),
            }
        })?;

        let mut handle = SimulatorHandle {
            id: HandleId::random(),
            endpoint,
            rpc_port,
            net_port,
            home: Some(home),
            child: None,
            state: LifecycleState::NotStarted,
        };
        info!(id = %handle.id, port = rpc_port, home = ?handle.home_dir(), "Starting sandbox");

        let deadline = self.deadline();
        self.init_home(&handle, deadline).await?;
        self.launch(&mut handle, deadline).await?;
        Ok(handle)
    }

    /// One startup budget covers init, spawn and readiness.
    fn deadline(&self) -> Instant {
        Instant::now() + self.config.startup_timeout
    }

    fn startup_timeout(&self) -> ProcessError {
        ProcessError::StartupTimeout {
            timeout: self.config.startup_timeout,
        }
    }

    async fn init_home(&self, handle: &SimulatorHandle, deadline: Instant) -> Result<(), ProcessError> {
        let home = handle.require_home()?;
        if home.join(VALIDATOR_KEY_FILE).exists() {
            return Ok(());
        }

        debug!(home = %home.display(), "Initialising sandbox home");
        let mut command = Command::new(&self.config.binary);
        command
            .arg("--home")
            .arg(home)
            .args(["init", "--chain-id", "localnet"])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout_at(deadline, command.output())
            .await
            .map_err(|_| self.startup_timeout())?
            .map_err(|source| ProcessError::Spawn {
                binary: self.config.binary.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProcessError::InitFailed {
                command: format!("{} --home {} init", self.config.binary.display(), home.display()),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Spawns the simulator on the handle's ports and home, then waits for readiness.
    async fn launch(&self, handle: &mut SimulatorHandle, deadline: Instant) -> Result<(), ProcessError> {
        let home = handle.require_home()?.to_path_buf();
        let log_path = home.join(LOG_FILE);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| ProcessError::HomeDir {
                path: log_path.clone(),
                source,
            })?;
        let stderr = log.try_clone().map_err(|source| ProcessError::HomeDir {
            path: log_path.clone(),
            source,
        })?;

        handle.state = LifecycleState::Starting;
        let child = Command::new(&self.config.binary)
            .arg("--home")
            .arg(&home)
            .arg("run")
            .arg("--rpc-addr")
            .arg(format!("127.0.0.1:{}", handle.rpc_port))
            .arg("--network-addr")
            .arg(format!("127.0.0.1:{}", handle.net_port))
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                handle.state = LifecycleState::Failed;
                ProcessError::Spawn {
                    binary: self.config.binary.clone(),
                    source,
                }
            })?;
        debug!(pid = ?child.id(), port = handle.rpc_port, "Sandbox process spawned");
        handle.child = Some(child);

        self.wait_ready(handle, deadline).await
    }

    /// Polls `status` until the sandbox answers as itself, it exits, or `deadline` passes.
    ///
    /// The ports were free when allocated but nothing holds them until the child binds,
    /// so a reply is only trusted when it carries this home's node key.
    async fn wait_ready(&self, handle: &mut SimulatorHandle, deadline: Instant) -> Result<(), ProcessError> {
        let expected = match handle.home_dir().map(node_public_key).transpose() {
            Ok(expected) => expected,
            Err(err) => return Err(self.fail(handle, err).await),
        };
        let client = match status_client(&handle.endpoint) {
            Ok(client) => client,
            Err(err) => return Err(self.fail(handle, err).await),
        };
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(1))
            .with_max_elapsed_time(None)
            .build();

        loop {
            if let Some(status) = handle.exit_status() {
                return Err(Self::exited(handle, status));
            }

            if let Ok(Ok(status)) = tokio::time::timeout_at(deadline, client.status()).await {
                if let Some(expected) = &expected {
                    if let Err(err) = check_node_key(handle.rpc_port, expected, &status) {
                        warn!(port = handle.rpc_port, %err, "Sandbox port answered by another node");
                        return Err(self.fail(handle, err).await);
                    }
                }
                if let Some(status) = handle.exit_status() {
                    return Err(Self::exited(handle, status));
                }
                handle.state = LifecycleState::Ready;
                info!(id = %handle.id, port = handle.rpc_port, "Sandbox ready");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(timeout = ?self.config.startup_timeout, "Sandbox did not become ready");
                return Err(self.fail(handle, self.startup_timeout()).await);
            }
            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }

    /// Kills whatever is left of a failed launch.
    async fn fail(&self, handle: &mut SimulatorHandle, err: ProcessError) -> ProcessError {
        self.kill(handle).await;
        handle.state = LifecycleState::Failed;
        err
    }

    fn exited(handle: &mut SimulatorHandle, status: ExitStatus) -> ProcessError {
        handle.child = None;
        handle.state = LifecycleState::Failed;
        let log_tail = handle.log_path().map(|p| log_tail(&p)).unwrap_or_default();
        warn!(%status, "Sandbox exited during startup");
        ProcessError::UnexpectedExit { status, log_tail }
    }

    /// Terminates the process group: SIGTERM, then SIGKILL once the grace period ends.
    ///
    /// Idempotent and infallible. Problems are logged, never returned, so a stuck
    /// process cannot fail teardown.
    pub async fn stop(&self, handle: &mut SimulatorHandle) {
        if handle.child.is_none() {
            if handle.state == LifecycleState::Ready && !handle.is_attached() {
                handle.state = LifecycleState::Stopped;
            }
            return;
        }

        handle.state = LifecycleState::Stopping;
        handle.signal_group(Signal::SIGTERM);

        let exited = match handle.child.as_mut() {
            Some(child) => tokio::time::timeout(self.config.stop_grace_period, child.wait())
                .await
                .is_ok(),
            None => true,
        };
        if !exited {
            warn!(grace = ?self.config.stop_grace_period, "Sandbox ignored SIGTERM, killing it");
            self.kill(handle).await;
        }

        handle.child = None;
        handle.state = LifecycleState::Stopped;
        debug!(id = %handle.id, "Sandbox stopped");
    }

    async fn kill(&self, handle: &mut SimulatorHandle) {
        handle.signal_group(Signal::SIGKILL);
        if let Some(mut child) = handle.child.take() {
            if let Err(err) = child.kill().await {
                debug!(%err, "Reaping sandbox process failed");
            }
        }
    }

    /// Whether the process is alive and answering RPC as itself.
    pub async fn is_ready(&self, handle: &mut SimulatorHandle) -> bool {
        if handle.state != LifecycleState::Ready {
            return false;
        }
        let running = match handle.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => handle.is_attached(),
        };
        if !running {
            handle.child = None;
            handle.state = LifecycleState::Failed;
            return false;
        }
        let Ok(client) = status_client(&handle.endpoint) else {
            return false;
        };
        let Ok(status) = client.status().await else {
            return false;
        };
        match handle.home_dir().map(node_public_key) {
            None => true,
            Some(Ok(expected)) => check_node_key(handle.rpc_port, &expected, &status).is_ok(),
            Some(Err(err)) => {
                debug!(%err, "Cannot verify sandbox identity");
                false
            }
        }
    }

    /// Stops the simulator if needed and starts it again on the same ports and home.
    pub async fn relaunch(&self, handle: &mut SimulatorHandle) -> Result<(), ProcessError> {
        if handle.is_attached() {
            return Err(ProcessError::NotReady { state: handle.state });
        }
        self.stop(handle).await;
        self.launch(handle, self.deadline()).await
    }

    /// Throws away all chain state and restarts from genesis.
    pub async fn reset_to_genesis(&self, handle: &mut SimulatorHandle) -> Result<(), ProcessError> {
        let data = handle.require_home()?.join(DATA_DIR);
        self.stop(handle).await;
        if data.exists() {
            fs::remove_dir_all(&data).map_err(|source| ProcessError::HomeDir { path: data, source })?;
        }
        info!(id = %handle.id, "Resetting sandbox to genesis");
        self.launch(handle, self.deadline()).await
    }

    /// The genesis account and its key, as written by `init`.
    pub fn validator_key(&self, handle: &SimulatorHandle) -> Result<(AccountId, KeyPair), ProcessError> {
        let path = handle.require_home()?.join(VALIDATOR_KEY_FILE);
        let file: ValidatorKeyFile = read_key_file(&path)?;
        let key = file.secret_key.parse().map_err(|err: ApplicationError| ProcessError::KeyFile {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        Ok((file.account_id, key))
    }
}

fn read_key_file<T: DeserializeOwned>(path: &Path) -> Result<T, ProcessError> {
    let invalid = |reason: String| ProcessError::KeyFile {
        path: path.to_path_buf(),
        reason,
    };
    let contents = fs::read_to_string(path).map_err(|err| invalid(err.to_string()))?;
    serde_json::from_str(&contents).map_err(|err| invalid(err.to_string()))
}

/// Public key of the node whose home is `home`, as written by `init`.
fn node_public_key(home: &Path) -> Result<String, ProcessError> {
    let file: NodeKeyFile = read_key_file(&home.join(NODE_KEY_FILE))?;
    Ok(file.public_key)
}

fn check_node_key(port: u16, expected: &str, status: &Value) -> Result<(), ProcessError> {
    let found = status
        .get("node_public_key")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if found == expected {
        Ok(())
    } else {
        Err(ProcessError::ForeignNode {
            port,
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

fn status_client(endpoint: &Url) -> Result<RpcClient, ProcessError> {
    RpcClient::new(endpoint.clone(), STATUS_TIMEOUT, RetryPolicy::default()).map_err(|err| {
        ProcessError::InvalidConfig {
            key: "endpoint",
            reason: err.to_string(),
        }
    })
}

fn free_port() -> Result<u16, ProcessError> {
    TcpListener::bind(("127.0.0.1", 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .map_err(ProcessError::PortAllocation)
}

fn ensure_port_free(port: u16) -> Result<(), ProcessError> {
    TcpListener::bind(("127.0.0.1", port))
        .map(drop)
        .map_err(|_| ProcessError::PortConflict { port })
}

fn log_tail(path: &Path) -> String {
    let contents = fs::read_to_string(path).unwrap_or_default();
    let lines: Vec<&str> = contents.lines().collect();
    lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::tests::rpc_ok;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method},
    };

    #[test]
    fn test_handle_ids_are_unique() {
        let a = HandleId::random();
        let b = HandleId::random();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 16);
    }

    #[test]
    fn test_free_ports_are_bindable() {
        let port = free_port().unwrap();
        assert!(port > 0);
        ensure_port_free(port).unwrap();
    }

    #[test]
    fn test_bound_port_is_a_conflict() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(matches!(ensure_port_free(port), Err(ProcessError::PortConflict { port: p }) if p == port));
    }

    #[test]
    fn test_log_tail_keeps_last_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOG_FILE);
        let lines: Vec<String> = (0..50).map(|i| format!("line {i}")).collect();
        fs::write(&path, lines.join("\n")).unwrap();

        let tail = log_tail(&path);
        assert_eq!(tail.lines().count(), LOG_TAIL_LINES);
        assert!(tail.ends_with("line 49"));
        assert_eq!(log_tail(&dir.path().join("missing.log")), "");
    }

    #[test]
    fn test_validator_key_accepts_legacy_field() {
        let dir = TempDir::new().unwrap();
        let key = KeyPair::generate().unwrap();
        fs::write(
            dir.path().join(VALIDATOR_KEY_FILE),
            json!({
                "account_id": "test.near",
                "public_key": key.public_key().to_string(),
                "private_key": key.secret_key().to_string(),
            })
            .to_string(),
        )
        .unwrap();

        let handle = SimulatorHandle::with_home(Url::parse("http://127.0.0.1:1").unwrap(), dir.path().to_path_buf());

        let supervisor = Supervisor::new(SandboxConfig::default());
        let (account, parsed) = supervisor.validator_key(&handle).unwrap();
        assert_eq!(account.as_str(), "test.near");
        assert_eq!(parsed.public_key(), key.public_key());
    }

    #[test]
    fn test_validator_key_missing_file() {
        let dir = TempDir::new().unwrap();
        let handle = SimulatorHandle::with_home(Url::parse("http://127.0.0.1:1").unwrap(), dir.path().to_path_buf());

        let err = Supervisor::new(SandboxConfig::default())
            .validator_key(&handle)
            .unwrap_err();
        assert!(matches!(err, ProcessError::KeyFile { .. }));
    }

    #[test]
    fn test_validator_key_with_bad_secret_is_a_key_file_error() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(VALIDATOR_KEY_FILE),
            json!({"account_id": "test.near", "secret_key": "ed25519:unused"}).to_string(),
        )
        .unwrap();
        let handle = SimulatorHandle::with_home(Url::parse("http://127.0.0.1:1").unwrap(), dir.path().to_path_buf());

        let err = Supervisor::new(SandboxConfig::default())
            .validator_key(&handle)
            .unwrap_err();
        assert!(matches!(err, ProcessError::KeyFile { ref path, .. } if path.ends_with(VALIDATOR_KEY_FILE)));
    }

    async fn status_server(node_public_key: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "status"})))
            .respond_with(rpc_ok(json!({
                "chain_id": "localnet",
                "node_public_key": node_public_key,
            })))
            .mount(&server)
            .await;
        server
    }

    fn starting_handle(server: &MockServer, node_key: Option<&str>) -> (TempDir, SimulatorHandle) {
        let dir = TempDir::new().unwrap();
        if let Some(key) = node_key {
            fs::write(
                dir.path().join(NODE_KEY_FILE),
                json!({"account_id": "node", "public_key": key, "secret_key": "ed25519:unused"}).to_string(),
            )
            .unwrap();
        }
        let mut handle = SimulatorHandle::with_home(server.uri().parse().unwrap(), dir.path().to_path_buf());
        handle.set_state(LifecycleState::Starting);
        (dir, handle)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_wait_ready_accepts_own_node() {
        let server = status_server("ed25519:ours").await;
        let (_dir, mut handle) = starting_handle(&server, Some("ed25519:ours"));

        Supervisor::new(SandboxConfig::default())
            .wait_ready(&mut handle, soon())
            .await
            .unwrap();
        assert_eq!(handle.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_wait_ready_rejects_foreign_node() {
        let server = status_server("ed25519:theirs").await;
        let (_dir, mut handle) = starting_handle(&server, Some("ed25519:ours"));

        let err = Supervisor::new(SandboxConfig::default())
            .wait_ready(&mut handle, soon())
            .await
            .unwrap_err();
        match err {
            ProcessError::ForeignNode { expected, found, .. } => {
                assert_eq!(expected, "ed25519:ours");
                assert_eq!(found, "ed25519:theirs");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(handle.state(), LifecycleState::Failed);
        // Rejected on the first answer, not retried.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_ready_needs_node_key() {
        let server = status_server("ed25519:ours").await;
        let (_dir, mut handle) = starting_handle(&server, None);

        let err = Supervisor::new(SandboxConfig::default())
            .wait_ready(&mut handle, soon())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::KeyFile { ref path, .. } if path.ends_with(NODE_KEY_FILE)));
        assert_eq!(handle.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_wait_ready_stops_at_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let (_dir, mut handle) = starting_handle(&server, Some("ed25519:ours"));
        let config = SandboxConfig::default().with_startup_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = Supervisor::new(config)
            .wait_ready(&mut handle, Instant::now() + Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::StartupTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
        assert_eq!(handle.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_for_attached_handles() {
        let supervisor = Supervisor::new(SandboxConfig::default());
        let mut handle = SimulatorHandle::attached(Url::parse("http://127.0.0.1:1").unwrap());
        supervisor.stop(&mut handle).await;
        supervisor.stop(&mut handle).await;
        assert_eq!(handle.state(), LifecycleState::Ready);
        assert!(handle.is_attached());
    }
}
