//! Domain records exchanged between the signal path, the exchange and the
//! stop-loss monitor.

use crate::decimal::{Price, Size};
use crate::side::{Action, PositionSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A parsed directional alert attributed to a strategy. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub strategy_id: String,
    /// Normalized symbol (market-type suffix stripped, uppercase).
    pub symbol: String,
    pub timeframe: String,
    pub action: Action,
}

impl fmt::Display for TradingSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} {}",
            self.strategy_id, self.symbol, self.timeframe, self.action
        )
    }
}

/// Live position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size in base units.
    pub size: Size,
    pub entry_price: Price,
    pub unrealized_pnl: Decimal,
}

/// Lot and price constraints for an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub qty_step: Option<Size>,
    pub min_qty: Option<Size>,
    pub max_qty: Option<Size>,
    pub tick_size: Option<Price>,
    /// Decimal places allowed on quantities, used when no step is known.
    pub qty_precision: Option<u32>,
}

/// Exchange-assigned order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client order ID attached to every submitted order so a retried request
/// can be matched to its first attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Format: `pivot_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = Utc::now().timestamp_millis();
        let uuid_short = &Uuid::new_v4().simple().to_string()[..8];
        Self(format!("pivot_{ts}_{uuid_short}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One last-trade price update for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn now(symbol: impl Into<String>, price: Price) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_order_id_format() {
        let id = ClientOrderId::new();
        assert!(id.as_str().starts_with("pivot_"));
        assert_ne!(id, ClientOrderId::new());
    }

    #[test]
    fn test_signal_display() {
        let signal = TradingSignal {
            strategy_id: "Pivot Reversal".to_string(),
            symbol: "ETHUSDT".to_string(),
            timeframe: "15m".to_string(),
            action: Action::Buy,
        };
        assert_eq!(signal.to_string(), "Pivot Reversal: ETHUSDT 15m buy");
    }
}
