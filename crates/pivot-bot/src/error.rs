//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signal error: {0}")]
    Signal(#[from] pivot_signal::SignalError),

    #[error("Exchange error: {0}")]
    Exchange(#[from] pivot_exchange::ExchangeError),

    #[error("Health error: {0}")]
    Health(#[from] pivot_health::HealthError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] pivot_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
