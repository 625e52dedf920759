//! Utility functions and types for the ingestion platform.

pub mod error;
mod logging;

pub use error::{Error, StoreError, ValidationError};
pub use logging::{init_logging, init_test_logging};

/// Re-export of commonly used types
pub mod prelude {
    pub use super::{
        error::{Error, Result, StoreError, ValidationError},
        logging::init_logging,
    };
}

/// Common result type for utility functions
pub type Result<T> = std::result::Result<T, Error>;

/// Host name stamped on telemetry and alert rows.
pub fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok().map(|h| h.trim().to_string()))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
