//! Error handling for the ingestion platform.

use thiserror::Error;

/// Main error type for the ingestion platform
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Store errors (connections, queries, inserts)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A single record failed coercion or an acceptance rule
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Malformed table schema
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Uncaught failure inside a feed pipeline
    #[error("Feed '{feed}' failed after {elapsed_ms:.1}ms: {message}")]
    FeedExecution {
        feed: String,
        elapsed_ms: f64,
        message: String,
    },

    /// Registry errors (unknown feed, illegal transition)
    #[error("Registry error: {0}")]
    Registry(String),

    /// Alert delivery errors
    #[error("Alert error: {0}")]
    Alert(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    /// Request errors
    #[error("Request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

/// Transient failures talking to the time-series store.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("query failed: {0}")]
    Query(String),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("no schema registered for table '{0}'")]
    UnknownTable(String),

    #[error("No valid records to insert")]
    NoValidRecords,

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Per-record validation failures. Always isolated to the offending record.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("column '{column}' cannot be null")]
    NullNotAllowed { column: String },

    #[error("column '{column}' expects {expected}, got {value}")]
    Incompatible {
        column: String,
        expected: String,
        value: String,
    },

    #[error("missing required fields: {}", fields.join(", "))]
    MissingRequired { fields: Vec<String> },

    #[error("rule '{rule}' rejected record: {reason}")]
    Rejected { rule: String, reason: String },
}

/// Result type for the ingestion platform
pub type Result<T> = std::result::Result<T, Error>;

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::Other(err)
    }
}

// Allow automatic conversion from anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Query(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let config_error = Error::ConfigError("missing field".to_string());
        assert_eq!(config_error.to_string(), "Configuration error: missing field");

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let wrapped_io_error = Error::from(io_error);
        assert!(wrapped_io_error.to_string().contains("I/O error"));

        let str_error = Error::from("custom error");
        assert_eq!(str_error.to_string(), "Error: custom error");
    }

    #[test]
    fn test_store_error_wrapping() {
        let err: Error = StoreError::NoValidRecords.into();
        assert_eq!(err.to_string(), "Store error: No valid records to insert");

        let exhausted = StoreError::RetriesExhausted { attempts: 3, last: "broken pipe".into() };
        assert_eq!(exhausted.to_string(), "gave up after 3 attempts: broken pipe");
    }

    #[test]
    fn test_validation_error_display() {
        let missing = ValidationError::MissingRequired {
            fields: vec!["symbol".into(), "price".into()],
        };
        assert_eq!(missing.to_string(), "missing required fields: symbol, price");

        let feed = Error::FeedExecution {
            feed: "vix".into(),
            elapsed_ms: 12.5,
            message: "timeout".into(),
        };
        assert_eq!(feed.to_string(), "Feed 'vix' failed after 12.5ms: timeout");
    }
}
