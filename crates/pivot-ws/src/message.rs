//! Ticker message decoding.
//!
//! The `<symbol>@ticker` stream pushes 24h rolling statistics; only the last
//! price (`c`) and event time (`E`) are used.

use crate::error::{WsError, WsResult};
use chrono::{DateTime, TimeZone, Utc};
use pivot_core::Price;
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Deserialize)]
struct TickerPayload {
    #[serde(rename = "s")]
    symbol: Option<String>,
    #[serde(rename = "c")]
    last_price: Option<String>,
    #[serde(rename = "E")]
    event_time_ms: Option<i64>,
}

/// Decoded last-price update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerUpdate {
    pub symbol: Option<String>,
    pub price: Price,
    pub timestamp: DateTime<Utc>,
}

/// Decode one text frame.
///
/// `Ok(None)` for well-formed frames without a last price (subscription
/// replies and the like). Malformed JSON or an unparseable price is an error,
/// which the stream treats as a reason to reconnect.
pub fn decode_ticker(text: &str) -> WsResult<Option<TickerUpdate>> {
    let payload: TickerPayload = serde_json::from_str(text)?;

    let Some(raw) = payload.last_price else {
        return Ok(None);
    };
    let price = Price::from_str(&raw)
        .map_err(|e| WsError::ParseError(format!("invalid last price {raw:?}: {e}")))?;

    let timestamp = payload
        .event_time_ms
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    Ok(Some(TickerUpdate {
        symbol: payload.symbol,
        price,
        timestamp,
    }))
}
