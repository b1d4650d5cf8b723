//! Alert text to [`TradingSignal`].
//!
//! Format: `<strategy>: <SYMBOL> <TIMEFRAME> <buy|sell>`.
//!
//! The strategy prefix is compared before anything else is looked at, so
//! alerts from other strategies never reach the body parser.

use crate::error::{SignalError, SignalResult};
use crate::strategy::{StrategyRegistration, StrategyRegistry};
use pivot_core::{Action, TradingSignal};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Routes alerts to the single enabled strategy.
#[derive(Debug)]
pub struct SignalRouter {
    active: StrategyRegistration,
    parse_attempts: AtomicU64,
}

impl SignalRouter {
    pub fn new(registry: &StrategyRegistry) -> Self {
        Self {
            active: registry.active().clone(),
            parse_attempts: AtomicU64::new(0),
        }
    }

    /// Identifier of the strategy this router accepts.
    pub fn strategy_id(&self) -> &str {
        &self.active.id
    }

    /// Number of alerts that passed the prefix check and were body-parsed.
    pub fn parse_attempts(&self) -> u64 {
        self.parse_attempts.load(Ordering::Relaxed)
    }

    /// Route one alert.
    ///
    /// - `Err(Empty)` for blank input
    /// - `Ok(None)` for alerts of another strategy, or a malformed body
    /// - `Ok(Some(signal))` otherwise
    pub fn route(&self, raw: &str) -> SignalResult<Option<TradingSignal>> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(SignalError::Empty);
        }

        let Some((claimed, body)) = text.split_once(':') else {
            debug!("Alert has no strategy prefix, ignoring");
            return Ok(None);
        };

        if !self.active.matches(claimed) {
            debug!(claimed = %claimed.trim(), "Alert for inactive strategy, ignoring");
            return Ok(None);
        }

        self.parse_attempts.fetch_add(1, Ordering::Relaxed);

        match parse_body(body) {
            Ok((symbol, timeframe, action)) => {
                let signal = TradingSignal {
                    strategy_id: self.active.id.clone(),
                    symbol,
                    timeframe,
                    action,
                };
                info!(symbol = %signal.symbol, action = %signal.action, timeframe = %signal.timeframe, "Signal parsed");
                Ok(Some(signal))
            }
            Err(e) => {
                warn!(error = %e, body = %body.trim(), "Alert from active strategy has malformed body");
                Ok(None)
            }
        }
    }
}

/// Parse `<SYMBOL> <TIMEFRAME> <buy|sell>`.
fn parse_body(body: &str) -> SignalResult<(String, String, Action)> {
    let tokens: Vec<&str> = body.split_whitespace().collect();
    let [symbol, timeframe, action] = tokens.as_slice() else {
        return Err(SignalError::Parse(format!(
            "expected 3 fields, got {}",
            tokens.len()
        )));
    };

    let symbol = parse_symbol(symbol)?;

    if !timeframe
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(SignalError::Parse(format!("invalid timeframe {timeframe:?}")));
    }

    let action = action
        .parse::<Action>()
        .map_err(|e| SignalError::Parse(e.to_string()))?;

    Ok((symbol, (*timeframe).to_string(), action))
}

/// Letters and digits, starting with a letter, with at most one trailing
/// `.SUFFIX` market-type marker. The marker is dropped; the rest is uppercased.
fn parse_symbol(token: &str) -> SignalResult<String> {
    let (base, suffix) = match token.split_once('.') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (token, None),
    };

    let starts_with_letter = base.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_with_letter || !base.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(SignalError::Parse(format!("invalid symbol {token:?}")));
    }

    if let Some(suffix) = suffix {
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(SignalError::Parse(format!("invalid symbol suffix {token:?}")));
        }
    }

    Ok(base.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRATEGY: &str = "Pivot Reversal SL (2, 1)";

    fn router() -> SignalRouter {
        let registry = StrategyRegistry::new(vec![
            StrategyRegistration::new(STRATEGY, true),
            StrategyRegistration::new("MACD (12, 26, 9)", false),
        ])
        .unwrap();
        SignalRouter::new(&registry)
    }

    #[test]
    fn test_routes_valid_alert() {
        let router = router();
        let signal = router
            .route("Pivot Reversal SL (2, 1): ETHUSDT 1 buy")
            .unwrap()
            .unwrap();

        assert_eq!(signal.strategy_id, STRATEGY);
        assert_eq!(signal.symbol, "ETHUSDT");
        assert_eq!(signal.timeframe, "1");
        assert_eq!(signal.action, Action::Buy);
    }

    #[test]
    fn test_action_case_insensitive_and_symbol_uppercased() {
        let router = router();
        let signal = router
            .route("Pivot Reversal SL (2, 1): ethusdt 15m SELL")
            .unwrap()
            .unwrap();
        assert_eq!(signal.symbol, "ETHUSDT");
        assert_eq!(signal.action, Action::Sell);
    }

    #[test]
    fn test_perpetual_suffix_stripped() {
        let router = router();
        let signal = router
            .route("Pivot Reversal SL (2, 1): BTCUSDT.P 4h buy")
            .unwrap()
            .unwrap();
        assert_eq!(signal.symbol, "BTCUSDT");
    }

    #[test]
    fn test_empty_input_is_error() {
        let router = router();
        assert!(matches!(router.route(""), Err(SignalError::Empty)));
        assert!(matches!(router.route("   \n"), Err(SignalError::Empty)));
    }

    #[test]
    fn test_other_strategy_rejected_before_parse() {
        let router = router();

        // Well formed but for a disabled strategy.
        assert!(router.route("MACD (12, 26, 9): ETHUSDT 1 buy").unwrap().is_none());
        // Garbage after a foreign prefix.
        assert!(router.route("Something else: !!! ??").unwrap().is_none());
        // No prefix at all.
        assert!(router.route("ETHUSDT 1 buy").unwrap().is_none());

        assert_eq!(router.parse_attempts(), 0);
    }

    #[test]
    fn test_malformed_body_is_dropped() {
        let router = router();
        let cases = [
            "Pivot Reversal SL (2, 1): ETHUSDT buy",
            "Pivot Reversal SL (2, 1): ETHUSDT 1 hold",
            "Pivot Reversal SL (2, 1): 1INCH 1 buy",
            "Pivot Reversal SL (2, 1): ETH-USDT 1 buy",
            "Pivot Reversal SL (2, 1): ETHUSDT.P.X 1 buy",
            "Pivot Reversal SL (2, 1): ETHUSDT 1 buy now",
        ];
        for case in cases {
            assert!(router.route(case).unwrap().is_none(), "accepted {case:?}");
        }
        assert_eq!(router.parse_attempts(), cases.len() as u64);
    }
}
