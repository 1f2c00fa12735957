//! Shared setup for unit and integration tests.

use crate::logging::setup_logging;

/// Call at the top of every test that wants tracing output.
pub fn setup_test() {
    setup_logging();
}
