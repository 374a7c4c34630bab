use std::{path::PathBuf, process::ExitStatus, time::Duration};

/// Failures of the simulator process itself: launching it, waiting for it to become
/// ready, or keeping it alive.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid configuration for {key}: {reason}")]
    InvalidConfig { key: &'static str, reason: String },
    #[error("port {port} is already in use")]
    PortConflict { port: u16 },
    #[error("failed to build the session runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("no free local port: {0}")]
    PortAllocation(#[source] std::io::Error),
    #[error("failed to spawn {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed with {status}: {stderr}")]
    InitFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("sandbox did not become ready within {timeout:?}")]
    StartupTimeout { timeout: Duration },
    #[error("sandbox exited unexpectedly with {status}; last log lines:\n{log_tail}")]
    UnexpectedExit { status: ExitStatus, log_tail: String },
    #[error("sandbox is not ready (state: {state})")]
    NotReady { state: crate::supervisor::LifecycleState },
    #[error("key file {} is unusable: {reason}", path.display())]
    KeyFile { path: PathBuf, reason: String },
    #[error("port {port} is served by another node ({found}), not this sandbox ({expected})")]
    ForeignNode {
        port: u16,
        expected: String,
        found: String,
    },
    #[error("compiling {} failed: {reason}", source_path.display())]
    Compile { source_path: PathBuf, reason: String },
    #[error("sandbox home directory {} is unusable: {source}", path.display())]
    HomeDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures to exchange a request with the simulator. Connection and timeout failures
/// are transient and retried before they surface.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request timed out")]
    RequestTimeout(#[source] reqwest::Error),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("rpc server error {name}: {message}")]
    Server { name: String, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("operation was cancelled before completing")]
    Cancelled,
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TransportError>,
    },
}

impl TransportError {
    /// Whether another attempt of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::RequestTimeout(_) | Self::Server { .. } => true,
            Self::HttpStatus { status, .. } => {
                matches!(status, 408 | 429 | 502 | 503 | 504)
            }
            Self::Timeout(_) | Self::Malformed(_) | Self::Cancelled | Self::RetriesExhausted { .. } => false,
        }
    }
}

/// Errors reported by the simulator about the request itself. These are never retried.
#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    #[error("account {0} does not exist")]
    UnknownAccount(String),
    #[error("contract execution failed: {0}")]
    ContractExecution(String),
    #[error("method {method} not found on {contract}")]
    MethodNotFound { contract: String, method: String },
    #[error("invalid transaction: {0}")]
    InvalidTransaction(serde_json::Value),
    #[error("transaction {transaction_hash} failed: {cause}")]
    ExecutionFailed {
        transaction_hash: String,
        cause: serde_json::Value,
    },
    #[error("no signing key known for {0}")]
    UnknownSigner(String),
    #[error("invalid account id `{id}`: {reason}")]
    InvalidAccountId { id: String, reason: String },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("arguments for {method} cannot be serialized: {reason}")]
    InvalidArguments { method: String, reason: String },
    #[error("{name}: {cause}")]
    Rpc {
        name: String,
        cause: serde_json::Value,
    },
}

/// Failures to capture or restore simulator state.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint `{label}` belongs to sandbox {owner}, not {current}")]
    Foreign {
        label: String,
        owner: String,
        current: String,
    },
    #[error("checkpoint `{0}` is unknown to this session")]
    Unknown(String),
    #[error("checkpoints need a sandbox with a managed home directory")]
    Unsupported,
    #[error("capturing checkpoint failed: {0}")]
    CaptureFailed(#[source] std::io::Error),
    #[error("restore failed, sandbox state is indeterminate: {reason}")]
    RestoreFailed { reason: String },
}

/// The payload of a response is not the structured data the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("response is not valid JSON: {message}")]
pub struct DecodeError {
    pub message: String,
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A failed operation, with the operation name and the identity it targeted.
#[derive(Debug, thiserror::Error)]
#[error("{operation} on `{target}` failed: {kind}")]
pub struct Error {
    pub operation: &'static str,
    pub target: String,
    #[source]
    pub kind: ErrorKind,
}

impl Error {
    pub fn new(operation: &'static str, target: impl Into<String>, kind: impl Into<ErrorKind>) -> Self {
        Self {
            operation,
            target: target.into(),
            kind: kind.into(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_process(&self) -> bool {
        matches!(self.kind, ErrorKind::Process(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport(_))
    }

    pub fn is_application(&self) -> bool {
        matches!(self.kind, ErrorKind::Application(_))
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self.kind, ErrorKind::Checkpoint(_))
    }

    pub fn is_decode(&self) -> bool {
        matches!(self.kind, ErrorKind::Decode(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attaches operation context to lower level results.
pub(crate) trait Context<T> {
    fn context(self, operation: &'static str, target: impl std::fmt::Display) -> Result<T>;
}

impl<T, E: Into<ErrorKind>> Context<T> for std::result::Result<T, E> {
    fn context(self, operation: &'static str, target: impl std::fmt::Display) -> Result<T> {
        self.map_err(|err| Error::new(operation, target.to_string(), err))
    }
}
