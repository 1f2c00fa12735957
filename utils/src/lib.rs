//! Small shared helpers: logging bootstrap and test setup.

pub mod logging;
pub mod test_utils;
