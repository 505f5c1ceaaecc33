//! Helpers shared by the tests of the stream tailer crates.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub mod tracing;

pub use crate::tracing::TracingCapture;

static LOG_SETUP: Once = Once::new();

/// Enables logging if `RUST_LOG` is set, with the filter it contains.
///
/// Log output goes through the test writer, so it is only shown for failing tests.
///
/// This is useful to debug a single test without drowning every other test run in logs:
///
/// ```shell
/// RUST_LOG=debug cargo test -p stream_tailer test_rescan
/// ```
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        LOG_SETUP.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}
