use std::{future::Future, panic, sync::Arc, time::Duration};

use tokio::runtime::{Builder, Runtime};
use tracing::trace;

use crate::error::{Context as _, ErrorKind, Result, TransportError};

/// Runs async operations to completion for blocking callers.
///
/// Every operation is spawned onto the session's multi-threaded runtime and the calling
/// thread waits for it, so several test threads can drive one session in parallel.
/// Must not be used from inside another tokio runtime.
#[derive(Debug, Clone)]
pub(crate) struct Bridge {
    runtime: Arc<Runtime>,
    timeout: Duration,
}

impl Bridge {
    pub(crate) fn new(worker_threads: usize, timeout: Duration) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("near-testbed")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
            timeout,
        })
    }

    /// Runs `future` bounded by the operation timeout. A timeout leaves the simulator
    /// running and surfaces as [`TransportError::Timeout`].
    pub(crate) fn run<T, F>(&self, operation: &'static str, target: impl ToString, future: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ErrorKind>> + Send + 'static,
    {
        let timeout = self.timeout;
        self.run_unbounded(operation, target, async move {
            match tokio::time::timeout(timeout, future).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout).into()),
            }
        })
    }

    /// Runs `future` without the operation timeout, for work that carries its own bound
    /// such as startup.
    pub(crate) fn run_unbounded<T, F>(&self, operation: &'static str, target: impl ToString, future: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ErrorKind>> + Send + 'static,
    {
        let target = target.to_string();
        trace!(operation, %target, "Dispatching");
        let task = self.runtime.spawn(future);
        match self.runtime.block_on(task) {
            Ok(result) => result.context(operation, target),
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(_) => Err(TransportError::Cancelled).context(operation, target),
        }
    }
}
