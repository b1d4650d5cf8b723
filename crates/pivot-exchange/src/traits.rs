//! Exchange capability trait.

use crate::error::ExchangeResult;
use async_trait::async_trait;
use pivot_core::{Action, ClientOrderId, InstrumentRules, OrderId, PositionSnapshot, Price, Size};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Reduce-only protective stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOrderRequest {
    pub symbol: String,
    /// Order side; always the closing side of the protected position.
    pub side: Action,
    pub quantity: Size,
    pub stop_price: Price,
    pub limit_price: Price,
}

/// Everything the engine needs from an exchange.
///
/// Implementations own their transport and sizing; the engine only speaks in
/// symbols, quote amounts and snapshots.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Available balance of `currency`. Zero when the account holds none.
    async fn get_balance(&self, currency: &str) -> ExchangeResult<Decimal>;

    /// Open position for `symbol`, `None` when flat.
    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<PositionSnapshot>>;

    /// Last price (polling).
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Price>;

    /// Market-buy using `quote_size` of margin. `Ok(false)` when the derived
    /// quantity is not tradable.
    ///
    /// `client_id` names the logical order and is sent unchanged on every
    /// attempt, so a resubmission can be recognised as the same order.
    async fn open_long(
        &self,
        symbol: &str,
        quote_size: Decimal,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool>;

    /// Market-sell using `quote_size` of margin.
    async fn open_short(
        &self,
        symbol: &str,
        quote_size: Decimal,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool>;

    /// Flatten `symbol` with a reduce-only market order. `Ok(true)` when
    /// already flat.
    async fn close_position(&self, symbol: &str, client_id: &ClientOrderId)
        -> ExchangeResult<bool>;

    async fn place_stop_order(&self, request: &StopOrderRequest) -> ExchangeResult<OrderId>;

    /// `Ok(false)` when the order was not found.
    async fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> ExchangeResult<bool>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    async fn get_instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules>;

    /// Strip market-type suffixes.
    fn normalize_symbol(&self, symbol: &str) -> String {
        pivot_core::normalize_symbol(symbol)
    }

    /// Quote currency whose balance backs positions in `symbol`.
    fn extract_quote_currency(&self, symbol: &str) -> String {
        pivot_core::extract_quote_currency(symbol)
    }
}
