#![forbid(unsafe_code)]

//! Tracing subscriber setup for binaries and tests.

use tracing_subscriber::EnvFilter;

use crate::types::{LogError, Result};

/// Installs a stderr `fmt` subscriber.
///
/// `RUST_LOG` wins over `default_level` when it is set.
pub fn init_logging(default_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .map_err(|err| LogError::InvalidOwned(format!("invalid log filter: {err}")))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .try_init()
        .map_err(|err| LogError::InvalidOwned(format!("tracing already initialised: {err}")))
}

/// Best-effort subscriber for tests; repeated calls are ignored.
pub fn init_test_logging() {
    let _ = init_logging("arclog=debug");
}
