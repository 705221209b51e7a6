use std::time::Duration;

use thiserror::Error;

/// The main error type for hotmacro operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A table could not grow to hold a new entry
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// An argument was rejected; the operation did nothing
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A lock or drain bound was exceeded
    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// How long we waited
        waited: Duration,
    },

    /// The sender collaborator failed to send a signal
    #[error("Send failed: {0}")]
    Send(String),

    /// Configuration could not be parsed
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Build a [`Error::Timeout`]
    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        Error::Timeout {
            what: what.into(),
            waited,
        }
    }

    /// Is this a lock or drain timeout?
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

/// Convenience type alias for Results using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl From<ron::error::SpannedError> for Error {
    fn from(err: ron::error::SpannedError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(err: std::collections::TryReserveError) -> Self {
        Error::Allocation(err.to_string())
    }
}
