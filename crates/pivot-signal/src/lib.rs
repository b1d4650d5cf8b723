//! Alert routing and duplicate filtering.
//!
//! Raw alert text flows through here before any exchange call is made:
//!
//! # Key Components
//!
//! - [`StrategyRegistry`]: Holds the strategy registrations, exactly one enabled
//! - [`SignalRouter`]: Cheap prefix check, then detailed parse into a [`TradingSignal`]
//! - [`DuplicateFilter`]: Collapses consecutive same-direction signals
//!
//! [`TradingSignal`]: pivot_core::TradingSignal

pub mod error;
pub mod filter;
pub mod router;
pub mod strategy;

pub use error::{SignalError, SignalResult};
pub use filter::{DuplicateFilter, FilterState};
pub use router::SignalRouter;
pub use strategy::{StrategyRegistration, StrategyRegistry};
