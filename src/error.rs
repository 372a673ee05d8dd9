//! Error types for the throttler.

use thiserror::Error;

/// Main error type for throttler setup and configuration.
#[derive(Error, Debug)]
pub enum ThrottlerError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while reading configuration sources
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for throttler operations.
pub type Result<T> = std::result::Result<T, ThrottlerError>;

/// Why a limiter refused to run a unit of work.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// The queue was at its high-water mark and the new unit was refused.
    #[error("This job has been dropped by the limiter because the queue is full")]
    Overflow,

    /// The unit was evicted from the queue to make room for a newer one.
    #[error("This job has been dropped by the limiter")]
    Dropped,

    /// The caller cancelled the unit before it was admitted.
    #[error("This job was cancelled before it was admitted")]
    Cancelled,
}

impl AdmissionError {
    /// Whether the limiter itself declined the work (as opposed to the caller
    /// withdrawing it).
    pub fn is_rejection(&self) -> bool {
        matches!(self, AdmissionError::Overflow | AdmissionError::Dropped)
    }
}

/// Outcome of a shaped outbound call that did not produce a value.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The remote call itself failed.
    #[error(transparent)]
    Api(E),

    /// A limiter on the call's path refused to run it.
    #[error("Outbound call rejected: {0}")]
    Rejected(AdmissionError),

    /// The caller cancelled the call while it was still queued.
    #[error("Outbound call cancelled before admission")]
    Cancelled,
}

impl<E> CallError<E> {
    /// Return the remote API error, if that is what this is.
    pub fn into_api(self) -> Option<E> {
        match self {
            CallError::Api(e) => Some(e),
            _ => None,
        }
    }
}
