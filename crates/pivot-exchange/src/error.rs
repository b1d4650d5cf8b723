//! Error types for pivot-exchange.

use thiserror::Error;

/// Exchange call errors.
///
/// Carries only owned text so errors can be compared and cloned; the retry
/// layer hands back the last one untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Exchange API error {code}: {msg}")]
    Api { code: i64, msg: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// Result type alias for exchange operations.
pub type ExchangeResult<T> = Result<T, ExchangeError>;
