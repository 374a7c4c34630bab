//! One sandbox per session, owned explicitly.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use rand::RngCore;
use serde::Serialize;
use tracing::info;
use url::Url;

use crate::{
    account::{Account, Contract},
    checkpoint::{Checkpoint, CheckpointManager},
    compiler::{ContractCompiler, Precompiled},
    config::SandboxConfig,
    error::{CheckpointError, Context as _, ProcessError, Result},
    gateway::{Gateway, Inner},
    logging,
    rpc::{RetryPolicy, RpcClient},
    runtime::Bridge,
    supervisor::{SimulatorHandle, Supervisor},
    transaction::KeyPair,
    types::{AccountId, NearToken},
};

/// A running sandbox with its root account.
///
/// ```no_run
/// use near_testbed::{SandboxConfig, Session};
///
/// let session = Session::start(SandboxConfig::from_env()?)?;
/// let alice = session.create_account("alice")?;
/// let counter = session.deploy_with_init("counter", "counter.wasm", "new", serde_json::json!({"starting_count": 0}))?;
/// let baseline = session.save_state("baseline")?;
///
/// counter.call_as(&alice, "increment").transact()?;
/// session.reset_state(&baseline)?;
/// assert_eq!(counter.view("get_count", serde_json::json!({}))?.json_as::<u64>()?, 0);
/// # Ok::<_, Box<dyn std::error::Error>>(())
/// ```
///
/// Dropping the session stops the sandbox.
pub struct Session {
    gateway: Gateway,
    root: Account,
    compiler: Arc<dyn ContractCompiler>,
    home_dir: Option<PathBuf>,
}

impl Session {
    /// Starts a sandbox configured from the environment.
    pub fn from_env() -> Result<Self> {
        let config = SandboxConfig::from_env().context("start", "environment")?;
        Self::start(config)
    }

    /// Starts a fresh sandbox and waits until it is ready.
    pub fn start(config: SandboxConfig) -> Result<Self> {
        logging::init();
        let binary = config.binary.display().to_string();
        config.validate().context("start", &binary)?;
        let bridge = Bridge::new(config.worker_threads, config.operation_timeout)
            .map_err(ProcessError::Runtime)
            .context("start", &binary)?;

        let supervisor = Supervisor::new(config.clone());
        let handle = {
            let supervisor = supervisor.clone();
            bridge.run_unbounded("start", &binary, async move { Ok(supervisor.start().await?) })?
        };
        let (root, root_key) = supervisor
            .validator_key(&handle)
            .context("start", handle.endpoint())?;
        let home_dir = handle.home_dir().map(Path::to_path_buf);
        info!(endpoint = %handle.endpoint(), root = %root, "Session started");

        Self::assemble(config, supervisor, handle, bridge, root, root_key, home_dir)
    }

    /// Connects to a sandbox that is already running. The session never stops it and
    /// cannot take checkpoints of it.
    pub fn attach(config: SandboxConfig, endpoint: Url, root: AccountId, root_key: KeyPair) -> Result<Self> {
        logging::init();
        config.validate().context("attach", &endpoint)?;
        let bridge = Bridge::new(config.worker_threads, config.operation_timeout)
            .map_err(ProcessError::Runtime)
            .context("attach", &endpoint)?;
        let handle = SimulatorHandle::attached(endpoint);
        let supervisor = Supervisor::new(config.clone());
        Self::assemble(config, supervisor, handle, bridge, root, root_key, None)
    }

    fn assemble(
        config: SandboxConfig,
        supervisor: Supervisor,
        handle: SimulatorHandle,
        bridge: Bridge,
        root: AccountId,
        root_key: KeyPair,
        home_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let endpoint = handle.endpoint().clone();
        let rpc = RpcClient::new(
            endpoint.clone(),
            config.request_timeout,
            RetryPolicy {
                attempts: config.retry_attempts,
                initial_interval: config.retry_initial_interval,
            },
        )
        .context("start", &endpoint)?;
        let checkpoints = CheckpointManager::new()
            .map_err(CheckpointError::CaptureFailed)
            .context("start", &endpoint)?;

        let inner = Inner::new(supervisor, handle, rpc, checkpoints, root.clone(), root_key);
        let gateway = Gateway::new(inner, bridge);
        Ok(Self {
            root: Account::new(root, gateway.clone()),
            gateway,
            compiler: Arc::new(Precompiled),
            home_dir,
        })
    }

    /// Replaces the default [`Precompiled`] compiler.
    pub fn with_compiler(mut self, compiler: impl ContractCompiler + 'static) -> Self {
        self.compiler = Arc::new(compiler);
        self
    }

    /// The genesis account.
    pub fn root(&self) -> &Account {
        &self.root
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn rpc_endpoint(&self) -> &Url {
        self.gateway.endpoint()
    }

    /// Home directory of a sandbox launched by this session.
    pub fn home_dir(&self) -> Option<&Path> {
        self.home_dir.as_deref()
    }

    /// Creates `<name>.<root>` with the default balance.
    pub fn create_account(&self, name: &str) -> Result<Account> {
        self.root.create_subaccount(name)
    }

    pub fn create_account_with_balance(&self, name: &str, balance: NearToken) -> Result<Account> {
        self.root.create_subaccount_with_balance(name, balance)
    }

    /// Creates `<prefix>-<8 hex chars>.<root>`, which never collides with earlier accounts.
    pub fn create_random_account(&self, prefix: &str) -> Result<Account> {
        self.create_account(&unique_name(prefix))
    }

    /// Compiles `source` with the session's compiler.
    pub fn compile_contract(&self, source: impl AsRef<Path>, single_file: bool) -> Result<PathBuf> {
        let source = source.as_ref();
        self.compiler
            .compile(source, single_file)
            .context("compile", source.display())
    }

    /// Deploys the contract at `path` to a fresh uniquely named account.
    pub fn deploy(&self, name: &str, path: impl AsRef<Path>) -> Result<Contract> {
        let wasm = self.read_contract(path.as_ref())?;
        self.create_random_account(name)?.deploy(wasm)
    }

    pub fn deploy_with_init(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        method: &str,
        args: impl Serialize,
    ) -> Result<Contract> {
        let wasm = self.read_contract(path.as_ref())?;
        self.create_random_account(name)?
            .deploy_with_init(wasm, method, args)
    }

    fn read_contract(&self, path: &Path) -> Result<Vec<u8>> {
        let wasm = self.compile_contract(path, true)?;
        std::fs::read(&wasm)
            .map_err(|err| ProcessError::Compile {
                source_path: wasm.clone(),
                reason: err.to_string(),
            })
            .context("deploy", wasm.display())
    }

    /// Captures the full chain state.
    pub fn save_state(&self, label: &str) -> Result<Checkpoint> {
        self.gateway.snapshot(label)
    }

    /// Returns the chain to `checkpoint`.
    pub fn reset_state(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.gateway.restore(checkpoint)
    }

    pub fn reset_to_genesis(&self) -> Result<()> {
        self.gateway.reset_to_genesis()
    }

    pub fn fast_forward(&self, blocks: u64) -> Result<()> {
        self.gateway.fast_forward(blocks)
    }

    pub fn is_ready(&self) -> bool {
        self.gateway.is_ready()
    }

    /// Stops the sandbox. Also happens on drop.
    pub fn stop(&self) {
        self.gateway.stop();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Blocking inside a runtime would panic; the handle's own drop kills the
        // process group in that case.
        if tokio::runtime::Handle::try_current().is_err() {
            self.gateway.stop();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.rpc_endpoint().as_str())
            .field("root", self.root.id())
            .field("home_dir", &self.home_dir)
            .finish_non_exhaustive()
    }
}

pub(crate) fn unique_name(prefix: &str) -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{prefix}-{}", hex::encode(bytes))
}
