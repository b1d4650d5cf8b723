//! Signal-to-position reconciliation.
//!
//! Maps a signal plus the live exchange position onto the smallest sequence
//! of exchange calls that leaves the account on the signal's side:
//!
//! | live position      | action                              |
//! |--------------------|-------------------------------------|
//! | none               | balance check, open                 |
//! | same side          | nothing                             |
//! | opposite side      | close, settle delay, balance, open  |
//!
//! A failed leg aborts the sequence. The compound close-and-reopen is never
//! retried here; single calls are retried by the exchange layer.

use crate::error::{PositionError, PositionResult};
use pivot_core::{Action, ClientOrderId, PositionSnapshot, TradingSignal};
use pivot_exchange::Exchange;
use pivot_telemetry::Metrics;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

fn default_position_size() -> Decimal {
    dec!(100)
}

fn default_reverse_settle_delay_ms() -> u64 {
    500
}

/// Reconciler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Margin committed per position, in quote currency.
    #[serde(default = "default_position_size")]
    pub position_size: Decimal,

    /// Wait between the close and the reopen of a reversal.
    #[serde(default = "default_reverse_settle_delay_ms")]
    pub reverse_settle_delay_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            position_size: default_position_size(),
            reverse_settle_delay_ms: default_reverse_settle_delay_ms(),
        }
    }
}

/// What reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// No position existed; one was opened.
    Opened,
    /// The live position already matched the signal.
    SkippedAlreadyAligned,
    /// The opposite position was closed and a new one opened.
    Reversed,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::SkippedAlreadyAligned => "skipped",
            Self::Reversed => "reversed",
        }
    }

    /// True when a new position was opened.
    pub fn opened_position(&self) -> bool {
        matches!(self, Self::Opened | Self::Reversed)
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciles signals against the live exchange position.
pub struct PositionReconciler {
    exchange: Arc<dyn Exchange>,
    config: ReconcilerConfig,
}

impl PositionReconciler {
    pub fn new(exchange: Arc<dyn Exchange>, config: ReconcilerConfig) -> Self {
        Self { exchange, config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Fetch the live position for the signal's symbol and reconcile.
    pub async fn reconcile(&self, signal: &TradingSignal) -> PositionResult<ReconcileAction> {
        let current = self.exchange.get_position(&signal.symbol).await?;
        self.reconcile_with(signal, current).await
    }

    /// Reconcile against an already fetched position.
    pub async fn reconcile_with(
        &self,
        signal: &TradingSignal,
        current: Option<PositionSnapshot>,
    ) -> PositionResult<ReconcileAction> {
        let result = match current {
            None => {
                info!(symbol = %signal.symbol, action = %signal.action, "No position, opening");
                self.open(signal).await.map(|()| ReconcileAction::Opened)
            }
            Some(position) if position.side.matches(signal.action) => {
                info!(
                    symbol = %signal.symbol,
                    side = %position.side,
                    size = %position.size,
                    "Position already aligned with signal, nothing to do"
                );
                Ok(ReconcileAction::SkippedAlreadyAligned)
            }
            Some(position) => self.reverse(signal, &position).await,
        };

        match &result {
            Ok(action) => Metrics::reconcile(action.as_str()),
            Err(e) => {
                error!(symbol = %signal.symbol, action = %signal.action, error = %e, "Reconciliation failed");
                Metrics::reconcile("failed");
            }
        }
        result
    }

    async fn reverse(
        &self,
        signal: &TradingSignal,
        position: &PositionSnapshot,
    ) -> PositionResult<ReconcileAction> {
        info!(
            symbol = %signal.symbol,
            from = %position.side,
            to = %signal.action.position_side(),
            size = %position.size,
            "Reversing position"
        );

        let close_id = ClientOrderId::new();
        if !self.exchange.close_position(&signal.symbol, &close_id).await? {
            return Err(PositionError::CloseRejected(signal.symbol.clone()));
        }

        tokio::time::sleep(Duration::from_millis(self.config.reverse_settle_delay_ms)).await;

        self.open(signal).await?;
        Ok(ReconcileAction::Reversed)
    }

    /// Balance check, then open on the signal's side.
    async fn open(&self, signal: &TradingSignal) -> PositionResult<()> {
        let currency = self.exchange.extract_quote_currency(&signal.symbol);
        let available = self.exchange.get_balance(&currency).await?;
        let required = self.config.position_size;

        if available < required {
            warn!(currency = %currency, %required, %available, "Insufficient balance, not opening");
            return Err(PositionError::InsufficientBalance {
                currency,
                required,
                available,
            });
        }

        let client_id = ClientOrderId::new();
        let opened = match signal.action {
            Action::Buy => {
                self.exchange
                    .open_long(&signal.symbol, required, &client_id)
                    .await?
            }
            Action::Sell => {
                self.exchange
                    .open_short(&signal.symbol, required, &client_id)
                    .await?
            }
        };
        if !opened {
            return Err(PositionError::OpenRejected(signal.symbol.clone()));
        }

        info!(symbol = %signal.symbol, side = %signal.action.position_side(), margin = %required, "Position opened");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivot_core::{PositionSide, Price, Size};
    use pivot_exchange::{ExchangeCall, PaperExchange, PaperOp};

    fn signal(action: Action) -> TradingSignal {
        TradingSignal {
            strategy_id: "Pivot".to_string(),
            symbol: "ETHUSDT".to_string(),
            timeframe: "1".to_string(),
            action,
        }
    }

    fn setup(balance: Decimal) -> (Arc<PaperExchange>, PositionReconciler) {
        let paper = Arc::new(PaperExchange::new(10));
        paper.set_price("ETHUSDT", Price::new(dec!(2000)));
        paper.set_balance("USDT", balance);
        let reconciler = PositionReconciler::new(
            paper.clone(),
            ReconcilerConfig {
                position_size: dec!(100),
                reverse_settle_delay_ms: 10,
            },
        );
        (paper, reconciler)
    }

    fn position(side: PositionSide) -> PositionSnapshot {
        PositionSnapshot {
            symbol: "ETHUSDT".to_string(),
            side,
            size: Size::new(dec!(0.5)),
            entry_price: Price::new(dec!(2000)),
            unrealized_pnl: Decimal::ZERO,
        }
    }

    fn ops(paper: &PaperExchange) -> Vec<PaperOp> {
        paper.calls().iter().map(ExchangeCall::op).collect()
    }

    #[tokio::test]
    async fn test_buy_without_position_opens_long() {
        let (paper, reconciler) = setup(dec!(1000));

        let action = reconciler.reconcile(&signal(Action::Buy)).await.unwrap();
        assert_eq!(action, ReconcileAction::Opened);

        let ops = ops(&paper);
        assert!(ops.contains(&PaperOp::OpenLong));
        assert!(!ops.contains(&PaperOp::ClosePosition));
        assert!(!ops.contains(&PaperOp::OpenShort));
    }

    #[tokio::test]
    async fn test_aligned_position_makes_no_order_calls() {
        let (paper, reconciler) = setup(dec!(1000));

        let action = reconciler
            .reconcile_with(&signal(Action::Sell), Some(position(PositionSide::Short)))
            .await
            .unwrap();
        assert_eq!(action, ReconcileAction::SkippedAlreadyAligned);
        assert!(paper.calls().is_empty());
    }

    #[tokio::test]
    async fn test_opposite_position_closes_before_opening() {
        let (paper, reconciler) = setup(dec!(1000));
        paper.set_position(position(PositionSide::Long));

        let action = reconciler.reconcile(&signal(Action::Sell)).await.unwrap();
        assert_eq!(action, ReconcileAction::Reversed);

        let ops = ops(&paper);
        let close = ops.iter().position(|op| *op == PaperOp::ClosePosition).unwrap();
        let open = ops.iter().position(|op| *op == PaperOp::OpenShort).unwrap();
        assert!(close < open);
        assert!(!ops.contains(&PaperOp::OpenLong));

        let live = paper.get_position("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(live.side, PositionSide::Short);
    }

    #[tokio::test]
    async fn test_insufficient_balance_makes_no_mutation() {
        let (paper, reconciler) = setup(dec!(50));

        let err = reconciler.reconcile(&signal(Action::Buy)).await.unwrap_err();
        match err {
            PositionError::InsufficientBalance {
                currency,
                required,
                available,
            } => {
                assert_eq!(currency, "USDT");
                assert_eq!(required, dec!(100));
                assert_eq!(available, dec!(50));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(paper.calls().iter().all(|c| !c.is_mutation()));
    }

    #[tokio::test]
    async fn test_failed_close_aborts_reversal() {
        let (paper, reconciler) = setup(dec!(1000));
        paper.set_position(position(PositionSide::Short));
        paper.fail_next(PaperOp::ClosePosition, 1);

        let err = reconciler.reconcile(&signal(Action::Buy)).await.unwrap_err();
        assert!(matches!(err, PositionError::Exchange(_)));

        let ops = ops(&paper);
        assert!(!ops.contains(&PaperOp::OpenLong));
        assert_eq!(ops.iter().filter(|op| **op == PaperOp::ClosePosition).count(), 1);
    }

    #[tokio::test]
    async fn test_untradable_quantity_is_open_rejected() {
        let (paper, reconciler) = setup(dec!(1000));
        paper.set_rules(
            "ETHUSDT",
            pivot_core::InstrumentRules {
                min_qty: Some(Size::new(dec!(0.001))),
                max_qty: Some(Size::new(dec!(0.01))),
                ..Default::default()
            },
        );

        let err = reconciler.reconcile(&signal(Action::Buy)).await.unwrap_err();
        assert!(matches!(err, PositionError::OpenRejected(symbol) if symbol == "ETHUSDT"));
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: ReconcilerConfig = toml::from_str("position_size = \"250\"").unwrap();
        assert_eq!(config.position_size, dec!(250));
        assert_eq!(config.reverse_settle_delay_ms, 500);
    }
}
