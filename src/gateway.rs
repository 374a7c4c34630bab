//! The blocking operation surface of a session.
//!
//! A [`Gateway`] turns typed operations into JSON-RPC requests against the supervised
//! simulator. Views and transactions hold the simulator handle shared; snapshot,
//! restore and stop hold it exclusively, so a restore never overlaps a request.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    checkpoint::{Checkpoint, CheckpointManager},
    error::{ApplicationError, Error, ErrorKind, ProcessError, Result, TransportError},
    response::Response,
    rpc::RpcClient,
    runtime::Bridge,
    supervisor::{LifecycleState, SimulatorHandle, Supervisor},
    transaction::{self, Action, KeyPair},
    types::{self as near, AccountId, AccountView, DEFAULT_GAS, NearGas, NearToken, StateItem},
};

/// Last nonce used by one signer, guarded so its transactions go out one at a time.
type SignerSlot = Arc<Mutex<Option<u64>>>;

pub(crate) struct Inner {
    supervisor: Supervisor,
    handle: RwLock<SimulatorHandle>,
    rpc: RpcClient,
    keys: DashMap<AccountId, KeyPair>,
    signers: DashMap<AccountId, SignerSlot>,
    checkpoints: Mutex<CheckpointManager>,
    root: AccountId,
}

impl Inner {
    pub(crate) fn new(
        supervisor: Supervisor,
        handle: SimulatorHandle,
        rpc: RpcClient,
        checkpoints: CheckpointManager,
        root: AccountId,
        root_key: KeyPair,
    ) -> Self {
        let keys = DashMap::new();
        keys.insert(root.clone(), root_key);
        Self {
            supervisor,
            handle: RwLock::new(handle),
            rpc,
            keys,
            signers: DashMap::new(),
            checkpoints: Mutex::new(checkpoints),
            root,
        }
    }

    fn ensure_ready(handle: &SimulatorHandle) -> Result<(), ErrorKind> {
        match handle.state() {
            LifecycleState::Ready => Ok(()),
            state => Err(ProcessError::NotReady { state }.into()),
        }
    }

    async fn view(&self, contract: &AccountId, method: &str, args: &[u8]) -> Result<Response, ErrorKind> {
        let handle = self.handle.read().await;
        Self::ensure_ready(&handle)?;
        let bytes = self.rpc.call_function(contract, method, args).await?;
        Ok(Response::new(bytes))
    }

    /// Signs `actions` as `signer` and submits them to `receiver`.
    ///
    /// The signer's slot is held from nonce lookup until the outcome is known, which
    /// orders a signer's transactions by submission while other signers proceed.
    async fn transact(&self, signer: &AccountId, receiver: &AccountId, actions: Vec<Action>) -> Result<Response, ErrorKind> {
        let handle = self.handle.read().await;
        Self::ensure_ready(&handle)?;

        let key = self
            .keys
            .get(signer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ApplicationError::UnknownSigner(signer.to_string()))?;
        let slot = self.signers.entry(signer.clone()).or_default().clone();
        let mut last_nonce = slot.lock().await;

        let access = self.rpc.view_access_key(signer, &key.public_key()).await?;
        let nonce = access.nonce.max(last_nonce.unwrap_or_default()) + 1;
        let signed = transaction::sign_transaction(signer, &key, nonce, receiver, access.block_hash, actions)
            .map_err(|err| TransportError::Malformed(format!("encoding transaction: {err}")))?;
        *last_nonce = Some(nonce);

        debug!(%signer, %receiver, nonce, "Submitting transaction");
        let (value, receipt) = self.rpc.send_tx(&signed).await?;
        drop(handle);
        Ok(Response::with_receipt(value, receipt))
    }

    async fn create_account(&self, parent: &AccountId, new_account: &AccountId, balance: NearToken) -> Result<(), ErrorKind> {
        let key = KeyPair::generate()?;
        let actions = vec![
            transaction::create_account(),
            transaction::transfer(balance),
            transaction::add_full_access_key(key.public_key()),
        ];
        self.transact(parent, new_account, actions).await?;
        self.keys.insert(new_account.clone(), key);
        info!(account_id = %new_account, "Created account");
        Ok(())
    }

    async fn view_account(&self, account: &AccountId) -> Result<AccountView, ErrorKind> {
        let handle = self.handle.read().await;
        Self::ensure_ready(&handle)?;
        self.rpc.view_account(account).await
    }

    async fn view_state(&self, contract: &AccountId, prefix: &[u8]) -> Result<Vec<StateItem>, ErrorKind> {
        let handle = self.handle.read().await;
        Self::ensure_ready(&handle)?;
        self.rpc.view_state(contract, prefix).await
    }

    async fn snapshot(&self, label: &str) -> Result<Checkpoint, ErrorKind> {
        let mut handle = self.handle.write().await;
        self.checkpoints
            .lock()
            .await
            .snapshot(&self.supervisor, &mut handle, label)
            .await
    }

    async fn restore(&self, checkpoint: &Checkpoint) -> Result<(), ErrorKind> {
        let mut handle = self.handle.write().await;
        let result = self
            .checkpoints
            .lock()
            .await
            .restore(&self.supervisor, &mut handle, checkpoint)
            .await;
        // Nonces may have gone backwards.
        self.signers.clear();
        Ok(result?)
    }

    async fn reset_to_genesis(&self) -> Result<(), ErrorKind> {
        let mut handle = self.handle.write().await;
        self.supervisor.reset_to_genesis(&mut handle).await?;
        self.signers.clear();
        self.keys.retain(|account, _| *account == self.root);
        Ok(())
    }

    async fn fast_forward(&self, blocks: u64) -> Result<(), ErrorKind> {
        let handle = self.handle.read().await;
        Self::ensure_ready(&handle)?;
        self.rpc.fast_forward(blocks).await
    }

    async fn patch_state(&self, records: Vec<Value>) -> Result<(), ErrorKind> {
        let handle = self.handle.read().await;
        Self::ensure_ready(&handle)?;
        self.rpc.patch_state(records).await?;
        self.signers.clear();
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        let mut handle = self.handle.write().await;
        self.supervisor.is_ready(&mut handle).await
    }

    async fn stop(&self) {
        let mut handle = self.handle.write().await;
        self.supervisor.stop(&mut handle).await;
    }
}

/// Synchronous access to one simulator. Cheap to clone; clones share the simulator,
/// the key store and the checkpoints.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
    bridge: Bridge,
}

impl Gateway {
    pub(crate) fn new(inner: Inner, bridge: Bridge) -> Self {
        Self {
            inner: Arc::new(inner),
            bridge,
        }
    }

    /// The genesis account that funds everything else.
    pub fn root(&self) -> &AccountId {
        &self.inner.root
    }

    pub fn endpoint(&self) -> &url::Url {
        self.inner.rpc.url()
    }

    /// Registers a key for an account created outside this gateway.
    pub fn import_key(&self, account: AccountId, key: KeyPair) {
        self.inner.keys.insert(account, key);
    }

    pub fn key(&self, account: &AccountId) -> Option<KeyPair> {
        self.inner.keys.get(account).map(|entry| entry.value().clone())
    }

    /// Runs a read-only contract method.
    pub fn view(&self, contract: &AccountId, method: &str, args: Vec<u8>) -> Result<Response> {
        let inner = self.inner.clone();
        let (contract, method) = (contract.clone(), method.to_string());
        self.bridge.run("view", format!("{contract}::{}", method), async move {
            inner.view(&contract, &method, &args).await
        })
    }

    /// Calls a contract method in a signed transaction.
    pub fn call(
        &self,
        signer: &AccountId,
        contract: &AccountId,
        method: &str,
        args: Vec<u8>,
        deposit: NearToken,
        gas: NearGas,
    ) -> Result<Response> {
        let action = transaction::function_call(method, args, gas, deposit);
        self.transact("call", signer, contract, vec![action])
    }

    /// Submits arbitrary actions signed by `signer`.
    pub fn transact(&self, operation: &'static str, signer: &AccountId, receiver: &AccountId, actions: Vec<Action>) -> Result<Response> {
        let inner = self.inner.clone();
        let (signer, target) = (signer.clone(), receiver.clone());
        self.bridge.run(operation, receiver, async move {
            inner.transact(&signer, &target, actions).await
        })
    }

    /// Creates `<name>.<parent>` funded with `balance` from `parent`.
    pub fn create_account(&self, parent: &AccountId, name: &str, balance: NearToken) -> Result<AccountId> {
        let new_account = near::sub_account(parent, name)
            .map_err(|err| Error::new("create_account", format!("{name}.{parent}"), err))?;
        let inner = self.inner.clone();
        let (parent, target) = (parent.clone(), new_account.clone());
        self.bridge.run("create_account", &new_account, async move {
            inner.create_account(&parent, &target, balance).await
        })?;
        Ok(new_account)
    }

    /// Deploys `wasm` to `account`, running `init` in the same transaction when given.
    pub fn deploy_contract(&self, account: &AccountId, wasm: Vec<u8>, init: Option<(&str, Vec<u8>)>) -> Result<Response> {
        let mut actions = vec![transaction::deploy_contract(wasm)];
        if let Some((method, args)) = init {
            actions.push(transaction::function_call(method, args, DEFAULT_GAS, NearToken::from_yoctonear(0)));
        }
        self.transact("deploy", account, account, actions)
    }

    pub fn view_account(&self, account: &AccountId) -> Result<AccountView> {
        let inner = self.inner.clone();
        let target = account.clone();
        self.bridge.run("view_account", account, async move {
            inner.view_account(&target).await
        })
    }

    pub fn balance(&self, account: &AccountId) -> Result<NearToken> {
        let inner = self.inner.clone();
        let target = account.clone();
        self.bridge.run("balance", account, async move {
            Ok(inner.view_account(&target).await?.amount)
        })
    }

    pub fn transfer(&self, from: &AccountId, to: &AccountId, amount: NearToken) -> Result<Response> {
        self.transact("transfer", from, to, vec![transaction::transfer(amount)])
    }

    /// Raw storage of `contract` whose keys start with `prefix`.
    pub fn view_state(&self, contract: &AccountId, prefix: &[u8]) -> Result<Vec<StateItem>> {
        let inner = self.inner.clone();
        let (target, prefix) = (contract.clone(), prefix.to_vec());
        self.bridge.run("view_state", contract, async move {
            inner.view_state(&target, &prefix).await
        })
    }

    /// Captures the full simulator state under `label`.
    ///
    /// Checkpoint operations relaunch the simulator and are bounded by the startup
    /// timeout, not the operation timeout.
    pub fn snapshot(&self, label: &str) -> Result<Checkpoint> {
        let inner = self.inner.clone();
        let owned = label.to_string();
        self.bridge
            .run_unbounded("snapshot", label, async move { inner.snapshot(&owned).await })
    }

    /// Returns the simulator to `checkpoint`. After a failure the sandbox is unusable
    /// until [`Gateway::reset_to_genesis`] succeeds.
    pub fn restore(&self, checkpoint: &Checkpoint) -> Result<()> {
        let inner = self.inner.clone();
        let owned = checkpoint.clone();
        self.bridge.run_unbounded("restore", checkpoint.label(), async move {
            inner.restore(&owned).await
        })
    }

    pub fn reset_to_genesis(&self) -> Result<()> {
        let inner = self.inner.clone();
        self.bridge.run_unbounded("reset_to_genesis", self.endpoint(), async move {
            inner.reset_to_genesis().await
        })
    }

    /// Produces `blocks` empty blocks.
    pub fn fast_forward(&self, blocks: u64) -> Result<()> {
        let inner = self.inner.clone();
        self.bridge.run("fast_forward", self.endpoint(), async move {
            inner.fast_forward(blocks).await
        })
    }

    /// Writes raw state records through `sandbox_patch_state`.
    pub fn patch_state(&self, records: Vec<Value>) -> Result<()> {
        let inner = self.inner.clone();
        self.bridge.run("patch_state", self.endpoint(), async move {
            inner.patch_state(records).await
        })
    }

    pub fn is_ready(&self) -> bool {
        let inner = self.inner.clone();
        self.bridge
            .run("is_ready", self.endpoint(), async move { Ok(inner.is_ready().await) })
            .unwrap_or(false)
    }

    /// Stops the simulator. Repeated calls are no-ops.
    pub fn stop(&self) {
        let inner = self.inner.clone();
        let _ = self.bridge.run_unbounded("stop", self.endpoint(), async move {
            inner.stop().await;
            Ok(())
        });
    }

    #[cfg(test)]
    pub(crate) fn with_handle<R>(&self, f: impl FnOnce(&SimulatorHandle) -> R) -> R {
        let handle = self.inner.handle.blocking_read();
        f(&handle)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("endpoint", &self.endpoint().as_str())
            .field("root", &self.inner.root)
            .finish_non_exhaustive()
    }
}
