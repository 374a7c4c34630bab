use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding the log filter, e.g. `info` or `near_testbed=debug`.
pub const LOG_ENV: &str = "NEAR_TESTBED_LOG";

const DEFAULT_FILTER: &str = "error";

/// Installs a formatting subscriber filtered by `NEAR_TESTBED_LOG`.
///
/// Safe to call from every session: when a global subscriber already exists (another
/// session or the test binary installed one) this is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}
