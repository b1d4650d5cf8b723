//! Alert handling pipeline.
//!
//! route → filter → stop monitor → reconcile → restart monitor.
//!
//! Alerts are processed one at a time. The filter lock is held for the whole
//! pipeline so a second alert cannot reconcile while the first is still
//! reversing a position.

use pivot_core::TradingSignal;
use pivot_position::{MonitorRequest, MonitorSupervisor, PositionReconciler, ReconcileAction};
use pivot_signal::{DuplicateFilter, SignalError, SignalRouter, StrategyRegistry};
use pivot_telemetry::Metrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What happened to an alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SignalOutcome {
    /// Alert not acted on.
    Ignored { message: String },
    Success {
        signal: TradingSignal,
        action: ReconcileAction,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<TradingSignal>,
    },
}

impl SignalOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored { .. } => "ignored",
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self::Ignored {
            message: message.into(),
        }
    }

    fn rejected(error: &SignalError) -> Self {
        warn!(error = %error, "Alert rejected");
        Self::Error {
            message: error.to_string(),
            signal: None,
        }
    }
}

pub struct SignalHandler {
    router: SignalRouter,
    filter: Mutex<DuplicateFilter>,
    reconciler: PositionReconciler,
    monitors: Arc<MonitorSupervisor>,
}

impl SignalHandler {
    pub fn new(
        registry: &StrategyRegistry,
        reconciler: PositionReconciler,
        monitors: Arc<MonitorSupervisor>,
    ) -> Self {
        Self {
            router: SignalRouter::new(registry),
            filter: Mutex::new(DuplicateFilter::new()),
            reconciler,
            monitors,
        }
    }

    pub async fn handle(&self, raw: &str) -> SignalOutcome {
        let outcome = self.process(raw).await;
        Metrics::signal_outcome(outcome.label());
        outcome
    }

    /// Outcome for a body that never reached the router.
    pub fn reject(&self, error: SignalError) -> SignalOutcome {
        let outcome = SignalOutcome::rejected(&error);
        Metrics::signal_outcome(outcome.label());
        outcome
    }

    async fn process(&self, raw: &str) -> SignalOutcome {
        let mut filter = self.filter.lock().await;

        let signal = match self.router.route(raw) {
            Ok(Some(signal)) => signal,
            Ok(None) => return SignalOutcome::ignored("signal not recognised or filtered"),
            Err(e) => return SignalOutcome::rejected(&e),
        };

        if !filter.should_process(signal.action) {
            return SignalOutcome::ignored(format!("duplicate {} signal", signal.action));
        }

        info!(signal = %signal, "Processing signal");
        self.monitors.stop().await;

        match self.reconciler.reconcile(&signal).await {
            Ok(action) => {
                self.monitors
                    .start(MonitorRequest {
                        symbol: signal.symbol.clone(),
                        expected_side: signal.action.position_side(),
                    })
                    .await;
                info!(signal = %signal, action = %action, "Signal handled");
                SignalOutcome::Success { signal, action }
            }
            Err(e) => SignalOutcome::Error {
                message: e.to_string(),
                signal: Some(signal),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivot_core::{Action, PositionSide, PositionSnapshot, Price, Size};
    use rust_decimal::Decimal;
    use pivot_exchange::{Exchange, ExchangeCall, PaperExchange, PaperOp};
    use pivot_position::{ReconcilerConfig, StopLossConfig};
    use pivot_signal::StrategyRegistration;
    use pivot_ws::ManualPriceFeed;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Fixture {
        paper: Arc<PaperExchange>,
        feed: Arc<ManualPriceFeed>,
        monitors: Arc<MonitorSupervisor>,
        handler: SignalHandler,
    }

    fn fixture(balance: Decimal) -> Fixture {
        let paper = Arc::new(PaperExchange::new(10));
        paper.set_price("ETHUSDT", Price::new(dec!(2000)));
        paper.set_balance("USDT", balance);
        let feed = Arc::new(ManualPriceFeed::new());
        let monitors = Arc::new(MonitorSupervisor::new(
            paper.clone(),
            feed.clone(),
            StopLossConfig {
                position_fetch_delay_ms: 10,
                ..Default::default()
            },
            10,
        ));
        let registry = StrategyRegistry::new(vec![
            StrategyRegistration::new("Pivot", true),
            StrategyRegistration::new("Breakout", false),
        ])
        .unwrap();
        let reconciler = PositionReconciler::new(
            paper.clone(),
            ReconcilerConfig {
                position_size: dec!(100),
                reverse_settle_delay_ms: 10,
            },
        );
        let handler = SignalHandler::new(&registry, reconciler, monitors.clone());
        Fixture {
            paper,
            feed,
            monitors,
            handler,
        }
    }

    #[tokio::test]
    async fn test_buy_opens_and_starts_monitor() {
        let f = fixture(dec!(1000));

        let outcome = f.handler.handle("Pivot: ETHUSDT.P 15 BUY").await;
        match &outcome {
            SignalOutcome::Success { signal, action } => {
                assert_eq!(signal.symbol, "ETHUSDT");
                assert_eq!(signal.action, Action::Buy);
                assert_eq!(*action, ReconcileAction::Opened);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(f.monitors.is_active().await);
        assert!(f.feed.wait_for_subscriber(Duration::from_secs(2)).await);
        assert_eq!(f.feed.subscribed_symbol().as_deref(), Some("ETHUSDT"));

        f.monitors.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_and_foreign_alerts_ignored() {
        let f = fixture(dec!(1000));

        assert_eq!(f.handler.handle("Pivot: ETHUSDT 15 buy").await.label(), "success");
        assert_eq!(f.handler.handle("Pivot: ETHUSDT 15 buy").await.label(), "ignored");
        assert_eq!(f.handler.handle("Breakout: ETHUSDT 15 sell").await.label(), "ignored");
        assert_eq!(f.handler.handle("Pivot: garbage").await.label(), "ignored");

        let opens = f
            .paper
            .calls()
            .iter()
            .filter(|c| c.op() == PaperOp::OpenLong)
            .count();
        assert_eq!(opens, 1);
        f.monitors.stop().await;
    }

    #[tokio::test]
    async fn test_empty_alert_is_error() {
        let f = fixture(dec!(1000));
        let outcome = f.handler.handle("   ").await;
        assert!(matches!(outcome, SignalOutcome::Error { signal: None, .. }));
        assert!(f.paper.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reject_reports_error_without_exchange_calls() {
        let f = fixture(dec!(1000));
        let outcome = f
            .handler
            .reject(SignalError::Parse("alert body is not valid UTF-8".to_string()));
        match outcome {
            SignalOutcome::Error { message, signal } => {
                assert!(message.contains("UTF-8"), "{message}");
                assert!(signal.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(f.paper.calls().is_empty());
    }

    #[tokio::test]
    async fn test_aligned_position_skips_and_reattaches_monitor() {
        let f = fixture(dec!(1000));
        f.paper.set_position(PositionSnapshot {
            symbol: "ETHUSDT".to_string(),
            side: PositionSide::Long,
            size: Size::new(dec!(0.5)),
            entry_price: Price::new(dec!(2000)),
            unrealized_pnl: Decimal::ZERO,
        });

        let outcome = f.handler.handle("Pivot: ETHUSDT 15 buy").await;
        assert!(matches!(
            outcome,
            SignalOutcome::Success {
                action: ReconcileAction::SkippedAlreadyAligned,
                ..
            }
        ));
        assert!(f.paper.calls().iter().all(|c| !matches!(
            c.op(),
            PaperOp::OpenLong | PaperOp::OpenShort | PaperOp::ClosePosition
        )));

        assert!(f.monitors.is_active().await);
        assert!(f.feed.wait_for_subscriber(Duration::from_secs(2)).await);
        assert_eq!(f.feed.subscribed_symbol().as_deref(), Some("ETHUSDT"));
        f.monitors.stop().await;
    }

    #[tokio::test]
    async fn test_reversal_cancels_stop_then_closes_before_open() {
        let f = fixture(dec!(1000));
        f.handler.handle("Pivot: ETHUSDT 15 buy").await;
        assert!(f.feed.wait_for_subscriber(Duration::from_secs(2)).await);

        // 0.5 ETH at 2000 with 10x leverage: margin 100, +5.5% at 2011.
        assert!(f.feed.push(Price::new(dec!(2011))).await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.paper.resting_stops().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        f.paper.clear_calls();
        let outcome = f.handler.handle("Pivot: ETHUSDT 15 sell").await;
        assert!(matches!(
            outcome,
            SignalOutcome::Success {
                action: ReconcileAction::Reversed,
                ..
            }
        ));

        let ops: Vec<PaperOp> = f.paper.calls().iter().map(ExchangeCall::op).collect();
        let cancel = ops.iter().position(|op| *op == PaperOp::CancelOrder).unwrap();
        let close = ops.iter().position(|op| *op == PaperOp::ClosePosition).unwrap();
        let open = ops.iter().position(|op| *op == PaperOp::OpenShort).unwrap();
        assert!(cancel < close && close < open);
        assert!(f.paper.resting_stops().is_empty());

        let live = f.paper.get_position("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(live.side, PositionSide::Short);
        f.monitors.stop().await;
    }

    #[tokio::test]
    async fn test_insufficient_balance_reported_as_error() {
        let f = fixture(dec!(50));

        let outcome = f.handler.handle("Pivot: ETHUSDT 15 buy").await;
        match outcome {
            SignalOutcome::Error { message, signal } => {
                assert!(message.contains("Insufficient"), "{message}");
                assert_eq!(signal.map(|s| s.action), Some(Action::Buy));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!f.monitors.is_active().await);
        assert!(f.paper.calls().iter().all(|c| !c.is_mutation()));
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(SignalOutcome::ignored("duplicate buy signal")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "ignored", "message": "duplicate buy signal"})
        );
    }
}
