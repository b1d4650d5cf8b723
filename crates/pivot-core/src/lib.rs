//! Core domain types for the pivot reversal bot.
//!
//! This crate provides the vocabulary shared by every other crate:
//! - `Price`, `Size`: Precision-safe numeric types
//! - `Action`, `PositionSide`: Signal direction and position direction
//! - `TradingSignal`, `PositionSnapshot`, `InstrumentRules`: Domain records
//! - `quantity`: Pure lot-step rounding and validation
//! - `symbol`: Pure symbol normalization helpers

pub mod decimal;
pub mod error;
pub mod quantity;
pub mod side;
pub mod symbol;
pub mod types;

pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use quantity::{check_quantity, quantity_for_margin, round_quantity, validate_quantity};
pub use side::{Action, PositionSide};
pub use symbol::{extract_quote_currency, normalize_symbol};
pub use types::{ClientOrderId, InstrumentRules, OrderId, PositionSnapshot, PriceTick, TradingSignal};
