//! Disposable NEAR sandboxes for contract tests.
//!
//! A [`Session`] launches a `near-sandbox` process on free ports in its own home
//! directory, exposes a blocking API over its JSON-RPC interface and saves or restores
//! the full chain state in a fraction of the time a redeploy takes.
//!
//! Two ways to use it:
//!
//! - hold a [`Session`] directly and checkpoint whenever it suits the test,
//! - build a [`Suite`], whose setup runs once and whose cases each start from the
//!   state that setup left behind.
//!
//! The sandbox binary is found through `NEAR_SANDBOX_BIN_PATH`; logs are filtered with
//! `NEAR_TESTBED_LOG`.

pub mod account;
pub mod checkpoint;
pub mod compiler;
pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod response;
mod rpc;
mod runtime;
pub mod session;
pub mod suite;
pub mod supervisor;
pub mod transaction;
pub mod types;

pub use account::{Account, CallBuilder, Contract, no_args};
pub use checkpoint::Checkpoint;
pub use compiler::{ContractCompiler, Precompiled};
pub use config::SandboxConfig;
pub use error::{
    ApplicationError, CheckpointError, DecodeError, Error, ErrorKind, ProcessError, Result, TransportError,
};
pub use gateway::Gateway;
pub use response::{ExecutionReceipt, Response};
pub use session::Session;
pub use suite::{Suite, SuiteSetup};
pub use supervisor::{LifecycleState, SimulatorHandle, Supervisor};
pub use transaction::KeyPair;
pub use types::{AccountId, AccountView, CryptoHash, DEFAULT_GAS, DEFAULT_INITIAL_BALANCE, NearGas, NearToken, StateItem};
