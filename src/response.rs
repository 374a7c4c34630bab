use std::{fmt, sync::OnceLock};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    error::DecodeError,
    types::{CryptoHash, NearGas},
};

/// Diagnostics of an executed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReceipt {
    pub transaction_hash: CryptoHash,
    /// Logs of every receipt, in execution order.
    pub logs: Vec<String>,
    pub gas_burnt: NearGas,
}

/// The payload returned by a view or a transaction.
///
/// `text()` and `json()` decode on first use and cache the result, so repeated calls
/// hand back the same value without parsing again.
pub struct Response {
    bytes: Vec<u8>,
    receipt: Option<ExecutionReceipt>,
    text: OnceLock<String>,
    json: OnceLock<Result<Value, DecodeError>>,
}

impl Response {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            receipt: None,
            text: OnceLock::new(),
            json: OnceLock::new(),
        }
    }

    pub(crate) fn with_receipt(bytes: Vec<u8>, receipt: ExecutionReceipt) -> Self {
        Self {
            receipt: Some(receipt),
            ..Self::new(bytes)
        }
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// The payload as UTF-8; invalid sequences are replaced.
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| String::from_utf8_lossy(&self.bytes).into_owned())
    }

    pub fn json(&self) -> Result<&Value, DecodeError> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.bytes).map_err(DecodeError::from))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Deserializes the cached JSON value into `T`.
    pub fn json_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let value = self.json()?;
        T::deserialize(value).map_err(DecodeError::from)
    }

    /// Present for transaction results, absent for views.
    pub fn receipt(&self) -> Option<&ExecutionReceipt> {
        self.receipt.as_ref()
    }

    pub fn logs(&self) -> &[String] {
        self.receipt.as_ref().map(|r| r.logs.as_slice()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("text", &self.text())
            .field("receipt", &self.receipt)
            .finish()
    }
}
