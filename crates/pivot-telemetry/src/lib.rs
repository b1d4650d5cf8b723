//! Prometheus metrics and structured logging.
//!
//! - Prometheus metrics for signals, reconciliation, stop orders, the price
//!   stream and process health
//! - Structured logging with tracing (JSON in production)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
