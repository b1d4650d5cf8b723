//! Error types for pivot-signal.

use thiserror::Error;

/// Signal routing errors.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Empty alert message")]
    Empty,

    #[error("Malformed alert body: {0}")]
    Parse(String),

    #[error("No enabled strategy configured")]
    NoActiveStrategy,

    #[error("More than one enabled strategy: {0:?}")]
    MultipleActiveStrategies(Vec<String>),
}

/// Result type alias for signal operations.
pub type SignalResult<T> = Result<T, SignalError>;
