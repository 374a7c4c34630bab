//! JSON-RPC transport to the sandbox.
//!
//! Transient failures are retried with exponential backoff:
//!
//! - failures to connect (the sandbox may still be warming up),
//! - request timeouts,
//! - rate limiting and overloaded servers (408, 429, 502, 503, 504),
//! - `INTERNAL_ERROR` and `TIMEOUT_ERROR` responses.
//!
//! Everything the server reports about the request itself is an [`ApplicationError`] and
//! is returned on the first attempt.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use backoff::{Error as BE, ExponentialBackoffBuilder};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::{
    error::{ApplicationError, ErrorKind, TransportError},
    response::ExecutionReceipt,
    transaction::{PublicKey, SignedTransaction, encode_signed},
    types::{AccountId, AccountView, CryptoHash, NearGas, StateItem},
};

const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Serialize)]
struct Request<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct Response {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

/// The `error` member of a NEAR JSON-RPC response.
#[derive(Debug, Clone, Deserialize)]
struct RpcErrorBody {
    name: Option<String>,
    cause: Option<RpcErrorCause>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcErrorCause {
    name: String,
    #[serde(default)]
    info: Value,
}

impl RpcErrorBody {
    fn cause_name(&self) -> &str {
        self.cause.as_ref().map(|c| c.name.as_str()).unwrap_or_default()
    }

    fn is_transient(&self) -> bool {
        self.name.as_deref() == Some("INTERNAL_ERROR")
            || matches!(self.cause_name(), "TIMEOUT_ERROR" | "NO_SYNCED_BLOCKS" | "NOT_SYNCED_YET")
    }

    fn into_kind(self) -> ErrorKind {
        if self.is_transient() {
            return TransportError::Server {
                name: self.cause_name().to_string(),
                message: self.message,
            }
            .into();
        }
        let Some(cause) = self.cause else {
            return ApplicationError::Rpc {
                name: self.name.unwrap_or_else(|| "UNKNOWN".to_string()),
                cause: self.data,
            }
            .into();
        };
        match cause.name.as_str() {
            "UNKNOWN_ACCOUNT" => {
                let account = cause
                    .info
                    .get("requested_account_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                ApplicationError::UnknownAccount(account).into()
            }
            "CONTRACT_EXECUTION_ERROR" => {
                let message = cause
                    .info
                    .get("vm_error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| cause.info.to_string());
                ApplicationError::ContractExecution(message).into()
            }
            "INVALID_TRANSACTION" => ApplicationError::InvalidTransaction(cause.info).into(),
            _ => ApplicationError::Rpc {
                name: cause.name,
                cause: cause.info,
            }
            .into(),
        }
    }
}

#[derive(Debug)]
pub struct RpcClient {
    url: Url,
    http: Client,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: Url, request_timeout: Duration, retry: RetryPolicy) -> Result<Self, TransportError> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| TransportError::Malformed(format!("http client: {err}")))?;
        Ok(Self {
            url,
            http,
            retry,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sends `method` with retries and decodes the `result` member as `R`.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R, ErrorKind>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let result = self.call_value(method, &params).await?;
        serde_json::from_value(result)
            .map_err(|err| TransportError::Malformed(format!("{method}: {err}")).into())
    }

    async fn call_value<P: Serialize>(&self, method: &str, params: &P) -> Result<Value, ErrorKind> {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_interval)
            .with_max_interval(MAX_RETRY_INTERVAL)
            .with_max_elapsed_time(None)
            .build();
        let attempts = AtomicU32::new(0);
        let max_attempts = self.retry.attempts.max(1);
        let (this, attempts) = (self, &attempts);

        let request = move || async move {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            match this.send_once(method, params).await {
                Ok(value) => Ok(value),
                Err(ErrorKind::Transport(err)) if err.is_transient() => {
                    if attempt >= max_attempts {
                        warn!(method, attempt, error = %err, "Transient failure, giving up");
                        return Err(BE::permanent(ErrorKind::from(TransportError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        })));
                    }
                    debug!(method, attempt, error = %err, "Transient failure, retrying");
                    Err(BE::transient(ErrorKind::from(err)))
                }
                Err(err) => Err(BE::permanent(err)),
            }
        };

        backoff::future::retry(backoff, request).await
    }

    /// One attempt, no retries.
    pub async fn send_once<P: Serialize>(&self, method: &str, params: &P) -> Result<Value, ErrorKind> {
        let request = Request {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|err| self.classify(err))?;

        // Error responses usually still carry a JSON-RPC body worth decoding.
        match serde_json::from_slice::<Response>(&body) {
            Ok(Response {
                error: Some(error), ..
            }) => Err(error.into_kind()),
            Ok(Response {
                result: Some(result),
                ..
            }) if status.is_success() => Ok(result),
            _ if !status.is_success() => Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }
            .into()),
            Ok(_) => Err(TransportError::Malformed(format!("{method}: neither result nor error")).into()),
            Err(err) => Err(TransportError::Malformed(format!("{method}: {err}")).into()),
        }
    }

    fn classify(&self, err: reqwest::Error) -> ErrorKind {
        if err.is_timeout() {
            TransportError::RequestTimeout(err).into()
        } else if err.is_connect() || err.is_request() {
            TransportError::Connect {
                endpoint: self.url.to_string(),
                source: err,
            }
            .into()
        } else if err.status() == Some(StatusCode::REQUEST_TIMEOUT) {
            TransportError::HttpStatus {
                status: StatusCode::REQUEST_TIMEOUT.as_u16(),
                body: err.to_string(),
            }
            .into()
        } else {
            TransportError::Malformed(err.to_string()).into()
        }
    }

    /// Single call to the `status` endpoint, used for readiness polling.
    pub async fn status(&self) -> Result<Value, ErrorKind> {
        self.send_once("status", &json!([])).await
    }
}

/// Result of `query` with `call_function`. Older sandboxes report contract failures
/// in an `error` string inside a successful result instead of a JSON-RPC error.
#[derive(Deserialize)]
struct CallFunctionResult {
    #[serde(default)]
    result: Vec<u8>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct AccessKeyResult {
    nonce: u64,
    block_hash: CryptoHash,
}

#[derive(Deserialize)]
struct ViewStateResult {
    values: Vec<StateEntry>,
}

#[derive(Deserialize)]
struct StateEntry {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct TxOutcome {
    status: Value,
    transaction: TxView,
    transaction_outcome: OutcomeWithId,
    #[serde(default)]
    receipts_outcome: Vec<OutcomeWithId>,
}

#[derive(Deserialize)]
struct TxView {
    hash: CryptoHash,
}

#[derive(Deserialize)]
struct OutcomeWithId {
    outcome: Outcome,
}

#[derive(Deserialize)]
struct Outcome {
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default)]
    gas_burnt: u64,
}

/// Nonce and a recent block hash for signing with one access key.
#[derive(Debug, Clone)]
pub struct AccessKeyNonce {
    pub nonce: u64,
    pub block_hash: CryptoHash,
}

fn decode_base64(field: &str, encoded: &str) -> Result<Vec<u8>, ErrorKind> {
    STANDARD
        .decode(encoded)
        .map_err(|err| TransportError::Malformed(format!("{field}: {err}")).into())
}

fn contract_error(contract: &AccountId, method: &str, message: String) -> ErrorKind {
    if message.contains("MethodNotFound") {
        ApplicationError::MethodNotFound {
            contract: contract.to_string(),
            method: method.to_string(),
        }
        .into()
    } else {
        ApplicationError::ContractExecution(message).into()
    }
}

impl RpcClient {
    /// Runs a view method at optimistic finality.
    pub async fn call_function(&self, contract: &AccountId, method: &str, args: &[u8]) -> Result<Vec<u8>, ErrorKind> {
        let params = json!({
            "request_type": "call_function",
            "finality": "optimistic",
            "account_id": contract,
            "method_name": method,
            "args_base64": STANDARD.encode(args),
        });
        let result: CallFunctionResult = match self.call("query", params).await {
            Err(ErrorKind::Application(ApplicationError::ContractExecution(message))) => {
                return Err(contract_error(contract, method, message));
            }
            other => other?,
        };
        match result.error {
            Some(message) => Err(contract_error(contract, method, message)),
            None => Ok(result.result),
        }
    }

    pub async fn view_account(&self, account: &AccountId) -> Result<AccountView, ErrorKind> {
        self.call(
            "query",
            json!({
                "request_type": "view_account",
                "finality": "optimistic",
                "account_id": account,
            }),
        )
        .await
    }

    pub async fn view_access_key(&self, account: &AccountId, public_key: &PublicKey) -> Result<AccessKeyNonce, ErrorKind> {
        let result: AccessKeyResult = self
            .call(
                "query",
                json!({
                    "request_type": "view_access_key",
                    "finality": "optimistic",
                    "account_id": account,
                    "public_key": public_key.to_string(),
                }),
            )
            .await?;
        Ok(AccessKeyNonce {
            nonce: result.nonce,
            block_hash: result.block_hash,
        })
    }

    /// Raw contract storage whose keys start with `prefix`.
    pub async fn view_state(&self, contract: &AccountId, prefix: &[u8]) -> Result<Vec<StateItem>, ErrorKind> {
        let result: ViewStateResult = self
            .call(
                "query",
                json!({
                    "request_type": "view_state",
                    "finality": "optimistic",
                    "account_id": contract,
                    "prefix_base64": STANDARD.encode(prefix),
                }),
            )
            .await?;
        result
            .values
            .into_iter()
            .map(|entry| {
                Ok(StateItem {
                    key: decode_base64("key", &entry.key)?,
                    value: decode_base64("value", &entry.value)?,
                })
            })
            .collect()
    }

    /// Submits a signed transaction and waits for optimistic execution.
    ///
    /// Retries resend the exact same bytes, so a transaction can land at most once.
    pub async fn send_tx(&self, signed: &SignedTransaction) -> Result<(Vec<u8>, ExecutionReceipt), ErrorKind> {
        let encoded = encode_signed(signed)
            .map_err(|err| TransportError::Malformed(format!("encoding transaction: {err}")))?;
        let outcome: TxOutcome = self
            .call(
                "send_tx",
                json!({
                    "signed_tx_base64": encoded,
                    "wait_until": "EXECUTED_OPTIMISTIC",
                }),
            )
            .await?;

        let transaction_hash = outcome.transaction.hash;
        let outcomes = std::iter::once(&outcome.transaction_outcome).chain(&outcome.receipts_outcome);
        let receipt = ExecutionReceipt {
            transaction_hash,
            logs: outcomes
                .clone()
                .flat_map(|o| o.outcome.logs.iter().cloned())
                .collect(),
            gas_burnt: NearGas::from_gas(outcomes.map(|o| o.outcome.gas_burnt).sum()),
        };

        if let Some(failure) = outcome.status.get("Failure") {
            return Err(ApplicationError::ExecutionFailed {
                transaction_hash: receipt.transaction_hash.to_string(),
                cause: failure.clone(),
            }
            .into());
        }
        let value = match outcome.status.get("SuccessValue").and_then(Value::as_str) {
            Some(encoded) => decode_base64("SuccessValue", encoded)?,
            None => Vec::new(),
        };
        Ok((value, receipt))
    }

    /// Produces `delta_height` empty blocks.
    pub async fn fast_forward(&self, delta_height: u64) -> Result<(), ErrorKind> {
        let _: Value = self
            .call("sandbox_fast_forward", json!({ "delta_height": delta_height }))
            .await?;
        Ok(())
    }

    /// Writes raw state records (accounts, access keys, contract code or data).
    pub async fn patch_state(&self, records: Vec<Value>) -> Result<(), ErrorKind> {
        let _: Value = self
            .call("sandbox_patch_state", json!({ "records": records }))
            .await?;
        Ok(())
    }
}
