//! In-memory exchange.
//!
//! Used for dry runs (`exchange.kind = "paper"`) and as the test double for
//! everything above the exchange layer. Every call is appended to an ordered
//! log before it is evaluated, so tests can assert call order and absence.

use crate::error::{ExchangeError, ExchangeResult};
use crate::traits::{Exchange, StopOrderRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use pivot_core::{
    check_quantity, quantity_for_margin, Action, ClientOrderId, InstrumentRules, OrderId,
    PositionSide, PositionSnapshot, Price, Size,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Operation kinds, for failure injection and log filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    GetBalance,
    GetPosition,
    GetPrice,
    OpenLong,
    OpenShort,
    ClosePosition,
    PlaceStopOrder,
    CancelOrder,
    SetLeverage,
    GetInstrumentRules,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeCall {
    GetBalance { currency: String },
    GetPosition { symbol: String },
    GetPrice { symbol: String },
    OpenLong {
        symbol: String,
        quote_size: Decimal,
        client_id: ClientOrderId,
    },
    OpenShort {
        symbol: String,
        quote_size: Decimal,
        client_id: ClientOrderId,
    },
    ClosePosition {
        symbol: String,
        client_id: ClientOrderId,
    },
    PlaceStopOrder(StopOrderRequest),
    CancelOrder { symbol: String, order_id: OrderId },
    SetLeverage { symbol: String, leverage: u32 },
    GetInstrumentRules { symbol: String },
}

impl ExchangeCall {
    pub fn op(&self) -> PaperOp {
        match self {
            Self::GetBalance { .. } => PaperOp::GetBalance,
            Self::GetPosition { .. } => PaperOp::GetPosition,
            Self::GetPrice { .. } => PaperOp::GetPrice,
            Self::OpenLong { .. } => PaperOp::OpenLong,
            Self::OpenShort { .. } => PaperOp::OpenShort,
            Self::ClosePosition { .. } => PaperOp::ClosePosition,
            Self::PlaceStopOrder(_) => PaperOp::PlaceStopOrder,
            Self::CancelOrder { .. } => PaperOp::CancelOrder,
            Self::SetLeverage { .. } => PaperOp::SetLeverage,
            Self::GetInstrumentRules { .. } => PaperOp::GetInstrumentRules,
        }
    }

    /// Client order id carried by market orders.
    pub fn client_id(&self) -> Option<&ClientOrderId> {
        match self {
            Self::OpenLong { client_id, .. }
            | Self::OpenShort { client_id, .. }
            | Self::ClosePosition { client_id, .. } => Some(client_id),
            _ => None,
        }
    }

    /// True for calls that change exchange state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self.op(),
            PaperOp::OpenLong
                | PaperOp::OpenShort
                | PaperOp::ClosePosition
                | PaperOp::PlaceStopOrder
                | PaperOp::CancelOrder
                | PaperOp::SetLeverage
        )
    }
}

#[derive(Debug, Default)]
struct PaperState {
    balances: HashMap<String, Decimal>,
    prices: HashMap<String, Price>,
    positions: HashMap<String, PositionSnapshot>,
    rules: HashMap<String, InstrumentRules>,
    leverage: HashMap<String, u32>,
    stops: Vec<(OrderId, StopOrderRequest)>,
    next_order_id: u64,
    failures: HashMap<PaperOp, u32>,
    calls: Vec<ExchangeCall>,
    /// Client ids of market orders already filled.
    filled: HashSet<ClientOrderId>,
}

/// In-memory exchange with one-way (netted) positions.
pub struct PaperExchange {
    default_leverage: u32,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(default_leverage: u32) -> Self {
        Self {
            default_leverage: default_leverage.max(1),
            state: Mutex::new(PaperState::default()),
        }
    }

    pub fn set_balance(&self, currency: &str, amount: Decimal) {
        self.state.lock().balances.insert(currency.to_string(), amount);
    }

    pub fn set_price(&self, symbol: &str, price: Price) {
        self.state.lock().prices.insert(symbol.to_string(), price);
    }

    pub fn set_rules(&self, symbol: &str, rules: InstrumentRules) {
        self.state.lock().rules.insert(symbol.to_string(), rules);
    }

    /// Seed a position directly, bypassing the call log.
    pub fn set_position(&self, position: PositionSnapshot) {
        self.state
            .lock()
            .positions
            .insert(position.symbol.clone(), position);
    }

    /// Make the next `n` calls of `op` fail with an API error.
    pub fn fail_next(&self, op: PaperOp, n: u32) {
        *self.state.lock().failures.entry(op).or_default() += n;
    }

    /// Snapshot of the call log, oldest first.
    pub fn calls(&self) -> Vec<ExchangeCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Resting stop orders, oldest first.
    pub fn resting_stops(&self) -> Vec<(OrderId, StopOrderRequest)> {
        self.state.lock().stops.clone()
    }

    /// Record `call` and consume a pending injected failure for it, if any.
    fn begin(state: &mut PaperState, call: ExchangeCall) -> ExchangeResult<()> {
        let op = call.op();
        debug!(?call, "Paper exchange call");
        state.calls.push(call);

        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ExchangeError::Api {
                    code: -1000,
                    msg: format!("injected {op:?} failure"),
                });
            }
        }
        Ok(())
    }

    fn price_of(state: &PaperState, symbol: &str) -> ExchangeResult<Price> {
        state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    fn open(
        &self,
        symbol: &str,
        quote_size: Decimal,
        action: Action,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        let mut state = self.state.lock();
        let call = match action {
            Action::Buy => ExchangeCall::OpenLong {
                symbol: symbol.to_string(),
                quote_size,
                client_id: client_id.clone(),
            },
            Action::Sell => ExchangeCall::OpenShort {
                symbol: symbol.to_string(),
                quote_size,
                client_id: client_id.clone(),
            },
        };
        Self::begin(&mut state, call)?;
        if state.filled.contains(client_id) {
            info!(symbol, client_order_id = %client_id, "Paper order already filled");
            return Ok(true);
        }

        let price = Self::price_of(&state, symbol)?;
        let rules = state.rules.get(symbol).cloned().unwrap_or_default();
        let leverage = state
            .leverage
            .get(symbol)
            .copied()
            .unwrap_or(self.default_leverage);

        let qty = quantity_for_margin(quote_size, leverage, price, &rules)
            .map_err(|e| ExchangeError::InvalidQuantity(e.to_string()))?;
        if let Err(e) = check_quantity(qty, &rules) {
            warn!(symbol, error = %e, "Paper open rejected");
            return Ok(false);
        }

        state.filled.insert(client_id.clone());
        let side = action.position_side();
        let next = match state.positions.remove(symbol) {
            None => Some(PositionSnapshot {
                symbol: symbol.to_string(),
                side,
                size: qty,
                entry_price: price,
                unrealized_pnl: Decimal::ZERO,
            }),
            Some(mut existing) if existing.side == side => {
                let total = existing.size + qty;
                let weighted = existing.size.notional(existing.entry_price) + qty.notional(price);
                existing.entry_price = Price::new(weighted / total.inner());
                existing.size = total;
                Some(existing)
            }
            Some(mut existing) => {
                if qty < existing.size {
                    existing.size = existing.size - qty;
                    Some(existing)
                } else if qty == existing.size {
                    None
                } else {
                    Some(PositionSnapshot {
                        symbol: symbol.to_string(),
                        side,
                        size: qty - existing.size,
                        entry_price: price,
                        unrealized_pnl: Decimal::ZERO,
                    })
                }
            }
        };

        if let Some(position) = next {
            info!(symbol, side = %position.side, size = %position.size, entry = %position.entry_price, "Paper position opened");
            state.positions.insert(symbol.to_string(), position);
        }
        Ok(true)
    }
}

fn unrealized(position: &PositionSnapshot, price: Price) -> Decimal {
    let diff = price.inner() - position.entry_price.inner();
    let signed = match position.side {
        PositionSide::Long => diff,
        PositionSide::Short => -diff,
    };
    signed * position.size.inner()
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_balance(&self, currency: &str) -> ExchangeResult<Decimal> {
        let mut state = self.state.lock();
        Self::begin(
            &mut state,
            ExchangeCall::GetBalance {
                currency: currency.to_string(),
            },
        )?;
        Ok(state.balances.get(currency).copied().unwrap_or_default())
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<PositionSnapshot>> {
        let mut state = self.state.lock();
        Self::begin(
            &mut state,
            ExchangeCall::GetPosition {
                symbol: symbol.to_string(),
            },
        )?;
        let price = state.prices.get(symbol).copied();
        Ok(state.positions.get(symbol).map(|p| {
            let mut p = p.clone();
            if let Some(price) = price {
                p.unrealized_pnl = unrealized(&p, price);
            }
            p
        }))
    }

    async fn get_price(&self, symbol: &str) -> ExchangeResult<Price> {
        let mut state = self.state.lock();
        Self::begin(
            &mut state,
            ExchangeCall::GetPrice {
                symbol: symbol.to_string(),
            },
        )?;
        Self::price_of(&state, symbol)
    }

    async fn open_long(
        &self,
        symbol: &str,
        quote_size: Decimal,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        self.open(symbol, quote_size, Action::Buy, client_id)
    }

    async fn open_short(
        &self,
        symbol: &str,
        quote_size: Decimal,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        self.open(symbol, quote_size, Action::Sell, client_id)
    }

    async fn close_position(
        &self,
        symbol: &str,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        let mut state = self.state.lock();
        Self::begin(
            &mut state,
            ExchangeCall::ClosePosition {
                symbol: symbol.to_string(),
                client_id: client_id.clone(),
            },
        )?;
        if !state.filled.insert(client_id.clone()) {
            info!(symbol, client_order_id = %client_id, "Paper close already filled");
            return Ok(true);
        }

        let Some(position) = state.positions.remove(symbol) else {
            debug!(symbol, "Paper close with no position");
            return Ok(true);
        };

        if let Some(price) = state.prices.get(symbol).copied() {
            let pnl = unrealized(&position, price);
            let quote = pivot_core::extract_quote_currency(symbol);
            *state.balances.entry(quote).or_default() += pnl;
            info!(symbol, pnl = %pnl, "Paper position closed");
        }
        Ok(true)
    }

    async fn place_stop_order(&self, request: &StopOrderRequest) -> ExchangeResult<OrderId> {
        let mut state = self.state.lock();
        Self::begin(&mut state, ExchangeCall::PlaceStopOrder(request.clone()))?;

        if !request.quantity.is_positive() {
            return Err(ExchangeError::InvalidQuantity(request.quantity.to_string()));
        }

        state.next_order_id += 1;
        let id = OrderId::new(format!("paper-{}", state.next_order_id));
        state.stops.push((id.clone(), request.clone()));
        Ok(id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> ExchangeResult<bool> {
        let mut state = self.state.lock();
        Self::begin(
            &mut state,
            ExchangeCall::CancelOrder {
                symbol: symbol.to_string(),
                order_id: order_id.clone(),
            },
        )?;
        let before = state.stops.len();
        state.stops.retain(|(id, _)| id != order_id);
        Ok(state.stops.len() < before)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let mut state = self.state.lock();
        Self::begin(
            &mut state,
            ExchangeCall::SetLeverage {
                symbol: symbol.to_string(),
                leverage,
            },
        )?;
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn get_instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules> {
        let mut state = self.state.lock();
        Self::begin(
            &mut state,
            ExchangeCall::GetInstrumentRules {
                symbol: symbol.to_string(),
            },
        )?;
        Ok(state.rules.get(symbol).cloned().unwrap_or_default())
    }
}
