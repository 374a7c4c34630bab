use std::fmt;

use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};

use crate::error::ApplicationError;

pub use near_api_types::{AccountId, CryptoHash, NearGas, NearToken};

/// 30 TGas, enough for ordinary contract methods.
pub const DEFAULT_GAS: NearGas = NearGas::from_tgas(30);
pub const DEFAULT_INITIAL_BALANCE: NearToken = NearToken::from_near(10);

/// Builds `<name>.<parent>`.
pub fn sub_account(parent: &AccountId, name: &str) -> Result<AccountId, ApplicationError> {
    let id = format!("{name}.{parent}");
    id.parse::<AccountId>()
        .map_err(|err| ApplicationError::InvalidAccountId {
            id: id.clone(),
            reason: err.to_string(),
        })
}

#[serde_as]
#[derive(Deserialize)]
struct AccountViewJson {
    #[serde_as(as = "DisplayFromStr")]
    amount: u128,
    #[serde_as(as = "DisplayFromStr")]
    locked: u128,
    code_hash: String,
    storage_usage: u64,
    block_height: u64,
}

/// Account state as reported by `view_account`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "AccountViewJson")]
pub struct AccountView {
    pub amount: NearToken,
    pub locked: NearToken,
    pub code_hash: String,
    pub storage_usage: u64,
    pub block_height: u64,
}

impl From<AccountViewJson> for AccountView {
    fn from(json: AccountViewJson) -> Self {
        Self {
            amount: NearToken::from_yoctonear(json.amount),
            locked: NearToken::from_yoctonear(json.locked),
            code_hash: json.code_hash,
            storage_usage: json.storage_usage,
            block_height: json.block_height,
        }
    }
}

impl AccountView {
    const EMPTY_CODE_HASH: &'static str = "11111111111111111111111111111111";

    pub fn has_contract(&self) -> bool {
        self.code_hash != Self::EMPTY_CODE_HASH
    }
}

/// One raw key/value pair of contract storage.
#[derive(Clone, PartialEq, Eq)]
pub struct StateItem {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl fmt::Debug for StateItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateItem")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("value", &hex::encode(&self.value))
            .finish()
    }
}
