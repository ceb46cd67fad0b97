//! Logging during tests.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Configures tracing for the current test.
///
/// Output is captured by the test framework and only shown on failure.
/// Defaults to TRACE for everything; set `RUST_LOG` to narrow it down.
#[must_use = "the tracing guard must live until the end of the test"]
pub(crate) fn setup_logging() -> tracing::subscriber::DefaultGuard {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::TRACE.into())
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(subscriber)
}
