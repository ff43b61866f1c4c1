//! Log subscriber setup
//!
//! The library only emits `tracing` events; binaries and tests decide where
//! they go. `RUST_LOG` selects the filter, `info` if unset.

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a compact stderr subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    fmt::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .compact()
        .try_init()
}

/// Route logs through the test harness capture. Safe to call from every
/// test.
pub fn init_for_tests() {
    let _ = fmt::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .with_test_writer()
        .try_init();
}
