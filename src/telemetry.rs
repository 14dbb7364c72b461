//! Tracing initialization for embedding daemons and tests.

use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

pub fn is_test_env() -> bool {
    std::env::var_os("RUST_TEST_THREADS").is_some()
}

fn filter_for(verbosity: u8) -> EnvFilter {
    let default = match verbosity {
        0 => "replicore=info",
        1 => "replicore=debug",
        _ => "replicore=trace",
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Second and later calls are no-ops, which
/// keeps test binaries that race on initialization safe.
pub fn init(verbosity: u8) {
    let registry = tracing_subscriber::registry()
        .with(filter_for(verbosity))
        .with(fmt::layer().with_target(false));
    let _ = registry.try_init();
}
