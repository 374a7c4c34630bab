//! Transaction assembly on top of the `near-api-types` protocol types.
//!
//! Only nonce and block-hash bookkeeping lives in this crate; layouts, key formats
//! and signatures come from `near-api-types`.

use std::{fmt, io, str::FromStr};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};

use crate::{
    error::ApplicationError,
    types::{AccountId, CryptoHash, NearGas, NearToken},
};

pub use near_api_types::{
    PublicKey, SecretKey, Signature,
    transaction::{
        SignedTransaction, Transaction, TransactionV0,
        actions::{
            AccessKey, AccessKeyPermission, Action, AddKeyAction, CreateAccountAction, DeployContractAction,
            FunctionCallAction, TransferAction,
        },
    },
};

pub fn create_account() -> Action {
    Action::CreateAccount(CreateAccountAction {})
}

pub fn deploy_contract(code: Vec<u8>) -> Action {
    Action::DeployContract(DeployContractAction { code })
}

pub fn function_call(method_name: impl Into<String>, args: Vec<u8>, gas: NearGas, deposit: NearToken) -> Action {
    Action::FunctionCall(Box::new(FunctionCallAction {
        method_name: method_name.into(),
        args,
        gas,
        deposit,
    }))
}

pub fn transfer(deposit: NearToken) -> Action {
    Action::Transfer(TransferAction { deposit })
}

pub fn add_full_access_key(public_key: PublicKey) -> Action {
    Action::AddKey(Box::new(AddKeyAction {
        public_key,
        access_key: AccessKey {
            nonce: near_api_types::json::U64(0),
            permission: AccessKeyPermission::FullAccess,
        },
    }))
}

/// A signing key in NEAR's `ed25519:<base58>` text format.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
}

impl KeyPair {
    pub fn generate() -> Result<Self, ApplicationError> {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        format!("ed25519:{}", bs58::encode(signing_key.to_keypair_bytes()).into_string()).parse()
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn sign(&self, message: &[u8; 32]) -> Signature {
        self.secret.sign(CryptoHash(*message))
    }
}

impl From<SecretKey> for KeyPair {
    fn from(secret: SecretKey) -> Self {
        Self { secret }
    }
}

impl FromStr for KeyPair {
    type Err = ApplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secret = s
            .parse::<SecretKey>()
            .map_err(|err| ApplicationError::InvalidKey(err.to_string()))?;
        Ok(Self { secret })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key().to_string())
            .finish_non_exhaustive()
    }
}

/// SHA-256 of the borsh encoding; this is what gets signed and what the chain
/// reports as the transaction hash.
pub fn transaction_hash(transaction: &Transaction) -> io::Result<[u8; 32]> {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(borsh::to_vec(transaction)?));
    Ok(hash)
}

pub(crate) fn sign_transaction(
    signer_id: &AccountId,
    key: &KeyPair,
    nonce: u64,
    receiver_id: &AccountId,
    block_hash: CryptoHash,
    actions: Vec<Action>,
) -> io::Result<SignedTransaction> {
    let transaction = Transaction::V0(TransactionV0 {
        signer_id: signer_id.clone(),
        public_key: key.public_key(),
        nonce,
        receiver_id: receiver_id.clone(),
        block_hash,
        actions,
    });
    let signature = key.sign(&transaction_hash(&transaction)?);
    Ok(SignedTransaction::new(signature, transaction))
}

pub(crate) fn encode_signed(signed: &SignedTransaction) -> io::Result<String> {
    Ok(STANDARD.encode(borsh::to_vec(signed)?))
}

#[cfg(test)]
pub(crate) fn decode_signed(encoded: &str) -> io::Result<SignedTransaction> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    borsh::from_slice(&bytes)
}

/// bs58 of SHA-256, the form the RPC uses for block and transaction hashes.
#[cfg(test)]
pub(crate) fn hash_of(bytes: &[u8]) -> CryptoHash {
    bs58::encode(Sha256::digest(bytes)).into_string().parse().unwrap()
}
