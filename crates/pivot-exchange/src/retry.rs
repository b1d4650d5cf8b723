//! Fixed-delay bounded retry.
//!
//! No jitter and no backoff: calls through here are order placement and
//! account reads, not a hot path.

use crate::error::ExchangeResult;
use crate::traits::{Exchange, StopOrderRequest};
use async_trait::async_trait;
use pivot_core::{ClientOrderId, InstrumentRules, OrderId, PositionSnapshot, Price};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    10_000
}

/// Retry bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wait between attempts.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping `policy.delay()`
/// between failures. The last error is returned as-is.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(op = op_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                error!(op = op_name, attempts = max_attempts, error = %e, "All attempts failed");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    delay_ms = policy.delay_ms,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(policy.delay()).await;
                attempt += 1;
            }
        }
    }
}

/// Runs reads, opens, closes, leverage and rules lookups of the wrapped
/// exchange through [`retry`].
///
/// Stop placement and cancellation pass through once. A second stop from a
/// retried placement that actually landed is worse than no stop, and the
/// monitor already tolerates a failed cancel.
pub struct RetryingExchange<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: Exchange> RetryingExchange<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: Exchange> Exchange for RetryingExchange<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_balance(&self, currency: &str) -> ExchangeResult<Decimal> {
        retry(&self.policy, "get_balance", || self.inner.get_balance(currency)).await
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<PositionSnapshot>> {
        retry(&self.policy, "get_position", || self.inner.get_position(symbol)).await
    }

    async fn get_price(&self, symbol: &str) -> ExchangeResult<Price> {
        retry(&self.policy, "get_price", || self.inner.get_price(symbol)).await
    }

    async fn open_long(
        &self,
        symbol: &str,
        quote_size: Decimal,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        retry(&self.policy, "open_long", || {
            self.inner.open_long(symbol, quote_size, client_id)
        })
        .await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quote_size: Decimal,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        retry(&self.policy, "open_short", || {
            self.inner.open_short(symbol, quote_size, client_id)
        })
        .await
    }

    async fn close_position(
        &self,
        symbol: &str,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        retry(&self.policy, "close_position", || {
            self.inner.close_position(symbol, client_id)
        })
        .await
    }

    async fn place_stop_order(&self, request: &StopOrderRequest) -> ExchangeResult<OrderId> {
        self.inner.place_stop_order(request).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> ExchangeResult<bool> {
        self.inner.cancel_order(symbol, order_id).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        retry(&self.policy, "set_leverage", || self.inner.set_leverage(symbol, leverage)).await
    }

    async fn get_instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules> {
        retry(&self.policy, "get_instrument_rules", || {
            self.inner.get_instrument_rules(symbol)
        })
        .await
    }

    fn normalize_symbol(&self, symbol: &str) -> String {
        self.inner.normalize_symbol(symbol)
    }

    fn extract_quote_currency(&self, symbol: &str) -> String {
        self.inner.extract_quote_currency(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::paper::{ExchangeCall, PaperExchange, PaperOp};
    use pivot_core::{Action, ClientOrderId, Size};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_always_failing_op_called_max_attempts_times() {
        let calls = AtomicU32::new(0);

        let result: Result<(), ExchangeError> = retry(&fast_policy(), "always_fails", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Err(ExchangeError::Api {
                    code: -1000,
                    msg: format!("failure {n}"),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            result.unwrap_err(),
            ExchangeError::Api {
                code: -1000,
                msg: "failure 3".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);

        let result = retry(&fast_policy(), "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ExchangeError::Http("timeout".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(1));

        let _: Result<(), ExchangeError> = retry(&policy, "once", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Http("down".to_string())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decorator_retries_reads_but_not_stop_orders() {
        let paper = PaperExchange::new(10);
        paper.set_balance("USDT", dec!(100));
        paper.fail_next(PaperOp::GetBalance, 2);
        paper.fail_next(PaperOp::PlaceStopOrder, 1);

        let exchange = RetryingExchange::new(paper, fast_policy());

        assert_eq!(exchange.get_balance("USDT").await.unwrap(), dec!(100));

        let request = StopOrderRequest {
            symbol: "ETHUSDT".to_string(),
            side: Action::Sell,
            quantity: Size::new(dec!(1)),
            stop_price: Price::new(dec!(2024)),
            limit_price: Price::new(dec!(2023)),
        };
        assert!(exchange.place_stop_order(&request).await.is_err());

        let calls = exchange.inner().calls();
        let balance_calls = calls
            .iter()
            .filter(|c| matches!(c, ExchangeCall::GetBalance { .. }))
            .count();
        let stop_calls = calls.iter().filter(|c| c.op() == PaperOp::PlaceStopOrder).count();
        assert_eq!(balance_calls, 3);
        assert_eq!(stop_calls, 1);
    }

    #[tokio::test]
    async fn test_retried_open_keeps_client_id() {
        let paper = PaperExchange::new(10);
        paper.set_price("ETHUSDT", Price::new(dec!(2000)));
        paper.fail_next(PaperOp::OpenLong, 2);

        let exchange = RetryingExchange::new(paper, RetryPolicy::new(3, Duration::ZERO));
        let id = ClientOrderId::new();
        assert!(exchange.open_long("ETHUSDT", dec!(100), &id).await.unwrap());

        let opens: Vec<ExchangeCall> = exchange
            .inner()
            .calls()
            .into_iter()
            .filter(|c| c.op() == PaperOp::OpenLong)
            .collect();
        assert_eq!(opens.len(), 3);
        assert!(opens.iter().all(|c| c.client_id() == Some(&id)));

        let position = exchange.get_position("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(position.size, Size::new(dec!(0.5)));
    }
}
