//! Test-case style usage: shared setup once, a clean baseline before every case.

use std::{collections::HashMap, path::Path};

use serde::Serialize;
use tracing::debug;

use crate::{
    account::{Account, Contract},
    checkpoint::Checkpoint,
    config::SandboxConfig,
    error::Result,
    session::Session,
};

const BASELINE: &str = "baseline";

/// Records the accounts and contracts created during [`Suite::setup`] by name.
pub struct SuiteSetup<'a> {
    session: &'a Session,
    accounts: HashMap<String, Account>,
    contracts: HashMap<String, Contract>,
}

impl SuiteSetup<'_> {
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Creates a uniquely named account, reachable later as `suite.account(name)`.
    pub fn create_account(&mut self, name: &str) -> Result<Account> {
        let account = self.session.create_random_account(name)?;
        self.accounts.insert(name.to_string(), account.clone());
        Ok(account)
    }

    pub fn deploy(&mut self, name: &str, path: impl AsRef<Path>) -> Result<Contract> {
        let contract = self.session.deploy(name, path)?;
        self.contracts.insert(name.to_string(), contract.clone());
        Ok(contract)
    }

    pub fn deploy_with_init(
        &mut self,
        name: &str,
        path: impl AsRef<Path>,
        method: &str,
        args: impl Serialize,
    ) -> Result<Contract> {
        let contract = self.session.deploy_with_init(name, path, method, args)?;
        self.contracts.insert(name.to_string(), contract.clone());
        Ok(contract)
    }
}

/// A session plus a baseline checkpoint taken after one-time setup.
///
/// Every [`Suite::case`] starts from that baseline, whatever earlier cases did.
pub struct Suite {
    session: Session,
    baseline: Checkpoint,
    accounts: HashMap<String, Account>,
    contracts: HashMap<String, Contract>,
}

impl Suite {
    /// Starts a sandbox, runs `setup` and captures the baseline.
    pub fn setup(config: SandboxConfig, setup: impl FnOnce(&mut SuiteSetup<'_>) -> Result<()>) -> Result<Self> {
        Self::from_session(Session::start(config)?, setup)
    }

    /// Like [`Suite::setup`] on a session that is already running.
    pub fn from_session(session: Session, setup: impl FnOnce(&mut SuiteSetup<'_>) -> Result<()>) -> Result<Self> {
        let mut recorder = SuiteSetup {
            session: &session,
            accounts: HashMap::new(),
            contracts: HashMap::new(),
        };
        setup(&mut recorder)?;
        let SuiteSetup {
            accounts, contracts, ..
        } = recorder;

        let baseline = session.save_state(BASELINE)?;
        debug!(accounts = accounts.len(), contracts = contracts.len(), "Suite baseline captured");
        Ok(Self {
            session,
            baseline,
            accounts,
            contracts,
        })
    }

    /// Restores the baseline, then runs `body`.
    pub fn case<R>(&self, body: impl FnOnce(&Suite) -> R) -> Result<R> {
        self.reset()?;
        Ok(body(self))
    }

    /// Restores the baseline.
    pub fn reset(&self) -> Result<()> {
        self.session.reset_state(&self.baseline)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn baseline(&self) -> &Checkpoint {
        &self.baseline
    }

    pub fn account(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    pub fn contract(&self, name: &str) -> Option<&Contract> {
        self.contracts.get(name)
    }
}

impl std::fmt::Debug for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Suite")
            .field("session", &self.session)
            .field("baseline", &self.baseline.label())
            .field("accounts", &self.accounts.keys().collect::<Vec<_>>())
            .field("contracts", &self.contracts.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{ApplicationError, Error},
        gateway::tests::Harness,
        transaction::KeyPair,
    };
    use std::time::Duration;

    fn attached_session(harness: &Harness) -> Session {
        Session::attach(
            SandboxConfig::default(),
            harness.server.uri().parse().unwrap(),
            "test.near".parse().unwrap(),
            KeyPair::generate().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_setup_errors_propagate() {
        let harness = Harness::new(Duration::from_secs(5));
        let err = Suite::from_session(attached_session(&harness), |_| {
            Err(Error::new("setup", "suite", ApplicationError::UnknownSigner("nobody".into())))
        })
        .unwrap_err();
        assert_eq!(err.operation, "setup");
    }

    #[test]
    fn test_baseline_needs_checkpoint_support() {
        let harness = Harness::new(Duration::from_secs(5));
        let mut ran = false;
        let err = Suite::from_session(attached_session(&harness), |setup| {
            ran = true;
            assert_eq!(setup.session().root().id().as_str(), "test.near");
            Ok(())
        })
        .unwrap_err();
        assert!(ran);
        assert!(err.is_checkpoint());
        assert_eq!(err.operation, "snapshot");
    }
}
