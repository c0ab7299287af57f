//! Error types for the test-run relay
//!
//! This module provides the crate-wide error enum using thiserror for
//! structured error definitions and anyhow for propagation at the CLI edge.

use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Port argument could not be parsed
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Record does not match the argument shape of its event
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Stop signal refused to raise (nothing left to cancel)
    #[error("Execution is not cancellable: {0}")]
    NotCancellable(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Convert anyhow::Error to RelayError
impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Other(err.to_string())
    }
}
