//! Error types for vCPU pinning runs.

use std::time::Duration;

/// Result type alias for pinning operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, planning or applying pinning.
///
/// A VM that cannot be found or whose power-off is declined is not an error:
/// the driver reports those as [`crate::driver::Outcome`]s and moves on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Session could not be established (bad credentials, unreachable, TLS).
    #[error("failed to connect to '{host}': {reason}")]
    Connect { host: String, reason: String },

    /// A call against the management endpoint failed.
    #[error("request '{operation}' failed: {reason}")]
    Request { operation: String, reason: String },

    /// The endpoint answered with a payload we could not decode.
    #[error("invalid response from endpoint: {0}")]
    InvalidResponse(String),

    // =========================================================================
    // Remote Task Errors
    // =========================================================================
    /// A remote task (power change, reconfiguration) finished in error.
    #[error("task '{operation}' failed: {reason}")]
    TaskFailed { operation: String, reason: String },

    /// A remote task did not finish in time.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// A row of the tabular input could not be parsed.
    #[error("malformed input row {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    /// Invalid run configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error (input file, console prompt).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a failed endpoint call.
    pub(crate) fn request(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Request {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}
