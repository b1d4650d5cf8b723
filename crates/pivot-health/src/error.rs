//! Health error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Self-test failed: {0}")]
    SelfTest(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Re-exec failed: {0}")]
    Reexec(String),
}

pub type HealthResult<T> = Result<T, HealthError>;
