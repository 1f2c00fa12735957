//! Logging bootstrap. The core itself never writes to the console; binaries
//! and tests install a `tracing` subscriber through here exactly once.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install the global `tracing` subscriber, honoring `RUST_LOG`. Safe to call
/// more than once; only the first call wins.
pub fn setup_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init()
            .ok();
    });
}
