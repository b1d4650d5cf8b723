//! Pivot reversal bot.
//!
//! Wires the engine crates into a running process:
//! - TOML configuration
//! - Signal handler (route, filter, reconcile, monitor)
//! - axum webhook listener with health, status and metrics endpoints
//! - Health monitor and restart handling

pub mod app;
pub mod config;
pub mod error;
pub mod handler;
pub mod server;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use handler::{SignalHandler, SignalOutcome};
