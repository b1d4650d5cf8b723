//! Position error types.

use pivot_exchange::ExchangeError;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Insufficient {currency} balance: required {required}, available {available}")]
    InsufficientBalance {
        currency: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("Exchange call failed: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("Exchange refused to open position on {0}")]
    OpenRejected(String),

    #[error("Exchange refused to close position on {0}")]
    CloseRejected(String),
}

pub type PositionResult<T> = Result<T, PositionError>;
