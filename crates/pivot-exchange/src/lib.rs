//! Exchange capability interface and its implementations.
//!
//! # Key Components
//!
//! - [`Exchange`]: The capability trait the engine calls into
//! - [`retry`] / [`RetryingExchange`]: Fixed-delay bounded retry for remote calls
//! - [`BinanceFuturesClient`]: Signed REST binding for Binance USDⓈ-M futures
//! - [`PaperExchange`]: In-memory exchange with an ordered call log

pub mod binance;
pub mod error;
pub mod paper;
pub mod retry;
pub mod traits;

pub use binance::{BinanceConfig, BinanceFuturesClient};
pub use error::{ExchangeError, ExchangeResult};
pub use paper::{ExchangeCall, PaperExchange, PaperOp};
pub use retry::{retry, RetryPolicy, RetryingExchange};
pub use traits::{Exchange, StopOrderRequest};
