//! Log subscriber setup.

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

fn filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

/// Installs a global subscriber writing to stdout. `RUST_LOG` overrides the
/// default level, INFO, or DEBUG when `verbose` is set.
pub fn init_subscriber(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(filter(default))
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .init();
}

/// Installs a subscriber for the current test thread only.
pub fn init_test_subscriber() -> DefaultGuard {
    tracing_subscriber::registry()
        .with(filter(LevelFilter::INFO))
        .with(fmt::layer().with_target(true).with_test_writer())
        .set_default()
}
