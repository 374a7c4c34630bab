//! Ergonomic wrappers over the [`Gateway`] for accounts and deployed contracts.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::{
    error::{ApplicationError, Error, Result},
    gateway::Gateway,
    response::Response,
    types::{AccountId, AccountView, DEFAULT_GAS, DEFAULT_INITIAL_BALANCE, NearGas, NearToken, StateItem},
};

/// Serializes call arguments. A failure is the caller's mistake, reported before
/// anything is sent.
fn json_args(method: &str, args: &impl Serialize) -> Result<Vec<u8>, ApplicationError> {
    serde_json::to_vec(args).map_err(|err| ApplicationError::InvalidArguments {
        method: method.to_string(),
        reason: err.to_string(),
    })
}

/// An account whose key the session holds.
#[derive(Clone)]
pub struct Account {
    id: AccountId,
    gateway: Gateway,
}

impl Account {
    pub(crate) fn new(id: AccountId, gateway: Gateway) -> Self {
        Self { id, gateway }
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    /// Creates `<name>.<self>` with the default initial balance.
    pub fn create_subaccount(&self, name: &str) -> Result<Account> {
        self.create_subaccount_with_balance(name, DEFAULT_INITIAL_BALANCE)
    }

    pub fn create_subaccount_with_balance(&self, name: &str, balance: NearToken) -> Result<Account> {
        let id = self.gateway.create_account(&self.id, name, balance)?;
        Ok(Account::new(id, self.gateway.clone()))
    }

    pub fn deploy(&self, wasm: Vec<u8>) -> Result<Contract> {
        self.gateway.deploy_contract(&self.id, wasm, None)?;
        Ok(Contract::new(self.clone()))
    }

    /// Deploys and runs `method` with JSON `args` in the same transaction.
    pub fn deploy_with_init(&self, wasm: Vec<u8>, method: &str, args: impl Serialize) -> Result<Contract> {
        let args = json_args(method, &args).map_err(|err| Error::new("deploy", self.id.to_string(), err))?;
        self.gateway.deploy_contract(&self.id, wasm, Some((method, args)))?;
        Ok(Contract::new(self.clone()))
    }

    /// Starts a call to `contract` signed by this account.
    pub fn call(&self, contract: &AccountId, method: &str) -> CallBuilder {
        CallBuilder::new(self.gateway.clone(), contract.clone(), method).signer(self.id.clone())
    }

    pub fn view(&self, contract: &AccountId, method: &str, args: impl Serialize) -> Result<Response> {
        let args = json_args(method, &args).map_err(|err| Error::new("view", format!("{contract}::{method}"), err))?;
        self.gateway.view(contract, method, args)
    }

    pub fn transfer(&self, to: &AccountId, amount: NearToken) -> Result<Response> {
        self.gateway.transfer(&self.id, to, amount)
    }

    pub fn balance(&self) -> Result<NearToken> {
        self.gateway.balance(&self.id)
    }

    pub fn view_account(&self) -> Result<AccountView> {
        self.gateway.view_account(&self.id)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Account").field(&self.id.as_str()).finish()
    }
}

/// An account with code deployed to it.
#[derive(Clone)]
pub struct Contract {
    account: Account,
}

impl Contract {
    pub(crate) fn new(account: Account) -> Self {
        Self { account }
    }

    pub fn id(&self) -> &AccountId {
        &self.account.id
    }

    /// Starts a call signed by the contract account itself.
    pub fn call(&self, method: &str) -> CallBuilder {
        self.account.call(self.id(), method)
    }

    /// Starts a call signed by `caller`.
    pub fn call_as(&self, caller: &Account, method: &str) -> CallBuilder {
        caller.call(self.id(), method)
    }

    pub fn view(&self, method: &str, args: impl Serialize) -> Result<Response> {
        self.account.view(self.id(), method, args)
    }

    pub fn view_state(&self, prefix: &[u8]) -> Result<Vec<StateItem>> {
        self.account.gateway.view_state(self.id(), prefix)
    }

    pub fn as_account(&self) -> &Account {
        &self.account
    }
}

impl fmt::Debug for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Contract").field(&self.id().as_str()).finish()
    }
}

/// A pending contract call. Nothing is sent until [`CallBuilder::transact`],
/// [`CallBuilder::transact_as`] or [`CallBuilder::view`].
#[must_use = "a call does nothing until transact() or view() is invoked"]
pub struct CallBuilder {
    gateway: Gateway,
    contract: AccountId,
    method: String,
    args: Result<Vec<u8>, ApplicationError>,
    deposit: NearToken,
    gas: NearGas,
    signer: Option<AccountId>,
}

impl CallBuilder {
    fn new(gateway: Gateway, contract: AccountId, method: &str) -> Self {
        Self {
            gateway,
            contract,
            method: method.to_string(),
            args: Ok(b"{}".to_vec()),
            deposit: NearToken::from_yoctonear(0),
            gas: DEFAULT_GAS,
            signer: None,
        }
    }

    fn signer(mut self, signer: AccountId) -> Self {
        self.signer = Some(signer);
        self
    }

    /// JSON arguments.
    pub fn args_json(mut self, args: impl Serialize) -> Self {
        self.args = json_args(&self.method, &args);
        self
    }

    /// Raw argument bytes, sent as is.
    pub fn args(mut self, args: Vec<u8>) -> Self {
        self.args = Ok(args);
        self
    }

    pub fn deposit(mut self, deposit: NearToken) -> Self {
        self.deposit = deposit;
        self
    }

    pub fn gas(mut self, gas: NearGas) -> Self {
        self.gas = gas;
        self
    }

    fn take_args(&mut self, operation: &'static str) -> Result<Vec<u8>> {
        std::mem::replace(&mut self.args, Ok(Vec::new()))
            .map_err(|err| Error::new(operation, format!("{}::{}", self.contract, self.method), err))
    }

    /// Sends the call as a transaction signed by the account that started it, or by the
    /// contract itself.
    pub fn transact(mut self) -> Result<Response> {
        let args = self.take_args("call")?;
        let signer = self.signer.clone().unwrap_or_else(|| self.contract.clone());
        self.gateway
            .call(&signer, &self.contract, &self.method, args, self.deposit, self.gas)
    }

    pub fn transact_as(self, signer: &Account) -> Result<Response> {
        self.signer(signer.id().clone()).transact()
    }

    /// Runs the method read-only. Deposit and gas are ignored.
    pub fn view(mut self) -> Result<Response> {
        let args = self.take_args("view")?;
        self.gateway.view(&self.contract, &self.method, args)
    }
}

impl fmt::Debug for CallBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallBuilder")
            .field("contract", &self.contract.as_str())
            .field("method", &self.method)
            .field("deposit", &self.deposit)
            .field("gas", &self.gas)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

/// `args` for methods that take none.
pub fn no_args() -> Value {
    Value::Object(Default::default())
}
