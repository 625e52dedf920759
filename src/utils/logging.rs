//! Logging configuration for the ingestion platform.

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Initialize the logging system.
///
/// `FEEDHUB_LOG` takes precedence over `level` when set. Calling this more
/// than once is harmless; only the first subscriber is installed.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_env("FEEDHUB_LOG").unwrap_or_else(|_| EnvFilter::new(level));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        info!("Logging initialized at level: {}", level);
    }
}

/// Initialize test logging (for use in tests)
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, error, warn};

    #[test]
    fn test_logging() {
        // Visual test - run with `cargo test -- --nocapture` to see the output
        init_logging("debug");

        error!("This is an error message");
        warn!("This is a warning message");
        info!("This is an info message");
        debug!("This is a debug message");
    }

    #[test]
    fn test_test_logging() {
        init_test_logging();
        init_test_logging();
        debug!("This debug message should only appear in test output with --nocapture");
    }
}
