//! Binance USDⓈ-M futures REST binding.
//!
//! Signed endpoints carry `timestamp` and `recvWindow` and an HMAC-SHA256
//! signature over the query string, hex encoded. Account mode is assumed
//! one-way (no hedge-mode `positionSide`).

use crate::error::{ExchangeError, ExchangeResult};
use crate::traits::{Exchange, StopOrderRequest};
use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use pivot_core::{
    check_quantity, quantity_for_margin, round_quantity, Action, ClientOrderId, InstrumentRules,
    OrderId, PositionSide, PositionSnapshot, Price, Size,
};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

pub const MAINNET_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Default timeout for REST requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// "No need to change leverage".
const LEVERAGE_NOT_MODIFIED: i64 = -4028;

/// Binance client settings.
#[derive(Clone)]
pub struct BinanceConfig {
    pub api_key: String,
    pub api_secret: Zeroizing<String>,
    pub testnet: bool,
    /// Leverage applied to every traded symbol.
    pub leverage: u32,
    pub recv_window_ms: u64,
    /// Overrides the mainnet/testnet URL.
    pub base_url: Option<String>,
}

impl std::fmt::Debug for BinanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceConfig")
            .field("api_key", &"<redacted>")
            .field("testnet", &self.testnet)
            .field("leverage", &self.leverage)
            .field("recv_window_ms", &self.recv_window_ms)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Error body returned by Binance on non-2xx responses.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

/// Signed REST client.
pub struct BinanceFuturesClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: Zeroizing<String>,
    leverage: u32,
    recv_window_ms: u64,
    /// Per-symbol rules; a cache hit also means leverage was configured.
    rules: DashMap<String, InstrumentRules>,
}

impl BinanceFuturesClient {
    pub fn new(config: BinanceConfig) -> ExchangeResult<Self> {
        if config.api_key.is_empty() || config.api_secret.is_empty() {
            return Err(ExchangeError::Config(
                "Binance API key and secret are required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Http(format!("Failed to create HTTP client: {e}")))?;

        let base_url = config.base_url.clone().unwrap_or_else(|| {
            if config.testnet {
                TESTNET_URL.to_string()
            } else {
                MAINNET_URL.to_string()
            }
        });

        info!(base_url = %base_url, leverage = config.leverage, "Binance futures client ready");

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            api_secret: config.api_secret,
            leverage: config.leverage.max(1),
            recv_window_ms: config.recv_window_ms,
            rules: DashMap::new(),
        })
    }

    // ====================================================================
    // Transport
    // ====================================================================

    async fn public_get(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(params).send().await?;
        Self::read_body(response).await
    }

    async fn signed(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<Value> {
        let mut query = encode_query(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            self.recv_window_ms,
            chrono::Utc::now().timestamp_millis()
        ));
        let signature = sign(&self.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::read_body(response).await
    }

    async fn read_body(response: reqwest::Response) -> ExchangeResult<Value> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(api) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(ExchangeError::Api {
                    code: api.code,
                    msg: api.msg,
                });
            }
            return Err(ExchangeError::Http(format!("HTTP {status}: {body}")));
        }

        Ok(serde_json::from_str(&body)?)
    }

    // ====================================================================
    // Orders
    // ====================================================================

    async fn market_order(
        &self,
        symbol: &str,
        side: Action,
        quantity: Size,
        reduce_only: bool,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<Value> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_wire().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
            ("newClientOrderId", client_id.to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        self.signed(Method::POST, "/fapi/v1/order", &params).await
    }

    async fn open(
        &self,
        symbol: &str,
        quote_size: Decimal,
        side: Action,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        let rules = self.get_instrument_rules(symbol).await?;
        let price = self.get_price(symbol).await?;

        let quantity = quantity_for_margin(quote_size, self.leverage, price, &rules)
            .map_err(|e| ExchangeError::InvalidQuantity(e.to_string()))?;
        if let Err(e) = check_quantity(quantity, &rules) {
            error!(symbol, error = %e, "Order quantity outside instrument bounds");
            return Ok(false);
        }

        info!(
            symbol,
            side = %side,
            quantity = %quantity,
            price = %price,
            margin = %quote_size,
            leverage = self.leverage,
            client_order_id = %client_id,
            "Placing market order"
        );
        self.market_order(symbol, side, quantity, false, client_id).await?;
        Ok(true)
    }
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    fn name(&self) -> &str {
        "binance"
    }

    async fn get_balance(&self, currency: &str) -> ExchangeResult<Decimal> {
        let account = self.signed(Method::GET, "/fapi/v2/account", &[]).await?;
        parse_balance(&account, currency)
    }

    async fn get_position(&self, symbol: &str) -> ExchangeResult<Option<PositionSnapshot>> {
        let positions = self
            .signed(
                Method::GET,
                "/fapi/v2/positionRisk",
                &[("symbol", symbol.to_string())],
            )
            .await?;
        parse_position(&positions, symbol)
    }

    async fn get_price(&self, symbol: &str) -> ExchangeResult<Price> {
        let ticker = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        decimal_field(&ticker, "price").map(Price::new)
    }

    async fn open_long(
        &self,
        symbol: &str,
        quote_size: Decimal,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        self.open(symbol, quote_size, Action::Buy, client_id).await
    }

    async fn open_short(
        &self,
        symbol: &str,
        quote_size: Decimal,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        self.open(symbol, quote_size, Action::Sell, client_id).await
    }

    async fn close_position(
        &self,
        symbol: &str,
        client_id: &ClientOrderId,
    ) -> ExchangeResult<bool> {
        let Some(position) = self.get_position(symbol).await? else {
            info!(symbol, "No position to close");
            return Ok(true);
        };

        let rules = self.get_instrument_rules(symbol).await?;
        let quantity = round_quantity(position.size, &rules);
        let side = position.side.closing_action();

        info!(symbol, side = %side, quantity = %quantity, client_order_id = %client_id, "Closing position");
        self.market_order(symbol, side, quantity, true, client_id).await?;
        Ok(true)
    }

    async fn place_stop_order(&self, request: &StopOrderRequest) -> ExchangeResult<OrderId> {
        let params = [
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_wire().to_string()),
            ("type", "STOP_MARKET".to_string()),
            ("quantity", request.quantity.to_string()),
            ("stopPrice", request.stop_price.to_string()),
            ("price", request.limit_price.to_string()),
            ("reduceOnly", "true".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("newClientOrderId", ClientOrderId::new().to_string()),
        ];
        let response = self.signed(Method::POST, "/fapi/v1/order", &params).await?;

        let order_id = match response.get("orderId") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => {
                return Err(ExchangeError::Decode(
                    "order response missing orderId".to_string(),
                ))
            }
        };
        Ok(OrderId::new(order_id))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> ExchangeResult<bool> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        match self.signed(Method::DELETE, "/fapi/v1/order", &params).await {
            Ok(_) => Ok(true),
            // Unknown order: already filled or cancelled.
            Err(ExchangeError::Api { code: -2011, msg }) => {
                warn!(symbol, order_id = %order_id, msg = %msg, "Order not found on cancel");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        match self.signed(Method::POST, "/fapi/v1/leverage", &params).await {
            Ok(_) => {
                info!(symbol, leverage, "Leverage set");
                Ok(())
            }
            Err(ExchangeError::Api {
                code: LEVERAGE_NOT_MODIFIED,
                ..
            }) => {
                debug!(symbol, leverage, "Leverage already set");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules> {
        if let Some(rules) = self.rules.get(symbol) {
            return Ok(rules.clone());
        }

        let info = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let rules = parse_rules(&info, symbol)?;
        info!(
            symbol,
            qty_step = ?rules.qty_step,
            min_qty = ?rules.min_qty,
            tick_size = ?rules.tick_size,
            "Instrument rules loaded"
        );

        // Leverage failure is logged, not fatal: the account keeps whatever
        // leverage it already had.
        if let Err(e) = self.set_leverage(symbol, self.leverage).await {
            error!(symbol, error = %e, "Failed to set leverage");
        }

        self.rules.insert(symbol.to_string(), rules.clone());
        Ok(rules)
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex HMAC-SHA256 of `payload`.
fn sign(secret: &str, payload: &str) -> ExchangeResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Config(format!("invalid API secret: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Decimal from a string (or number) field.
fn decimal_field(value: &Value, field: &str) -> ExchangeResult<Decimal> {
    match value.get(field) {
        Some(Value::String(s)) => Decimal::from_str(s)
            .map_err(|e| ExchangeError::Decode(format!("{field}: {e}"))),
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map_err(|e| ExchangeError::Decode(format!("{field}: {e}"))),
        _ => Err(ExchangeError::Decode(format!("missing field {field}"))),
    }
}

fn parse_balance(account: &Value, currency: &str) -> ExchangeResult<Decimal> {
    let assets = account
        .get("assets")
        .and_then(Value::as_array)
        .ok_or_else(|| ExchangeError::Decode("account missing assets".to_string()))?;

    match assets
        .iter()
        .find(|a| a.get("asset").and_then(Value::as_str) == Some(currency))
    {
        Some(asset) => decimal_field(asset, "walletBalance"),
        None => Ok(Decimal::ZERO),
    }
}

fn parse_position(positions: &Value, symbol: &str) -> ExchangeResult<Option<PositionSnapshot>> {
    let entries = positions
        .as_array()
        .ok_or_else(|| ExchangeError::Decode("positionRisk is not an array".to_string()))?;

    for entry in entries {
        if entry.get("symbol").and_then(Value::as_str) != Some(symbol) {
            continue;
        }
        let amount = decimal_field(entry, "positionAmt")?;
        if amount.is_zero() {
            continue;
        }
        let side = if amount.is_sign_positive() {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        return Ok(Some(PositionSnapshot {
            symbol: symbol.to_string(),
            side,
            size: Size::new(amount.abs()),
            entry_price: Price::new(decimal_field(entry, "entryPrice")?),
            unrealized_pnl: decimal_field(entry, "unRealizedProfit").unwrap_or_default(),
        }));
    }
    Ok(None)
}

fn parse_rules(info: &Value, symbol: &str) -> ExchangeResult<InstrumentRules> {
    let entry = info
        .get("symbols")
        .and_then(Value::as_array)
        .and_then(|symbols| {
            symbols
                .iter()
                .find(|s| s.get("symbol").and_then(Value::as_str) == Some(symbol))
        })
        .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))?;

    let mut rules = InstrumentRules {
        qty_precision: entry
            .get("quantityPrecision")
            .and_then(Value::as_u64)
            .map(|p| p as u32),
        ..Default::default()
    };

    let filters = entry
        .get("filters")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for filter in filters {
        match filter.get("filterType").and_then(Value::as_str) {
            Some("LOT_SIZE") => {
                rules.qty_step = decimal_field(filter, "stepSize").ok().map(Size::new);
                rules.min_qty = decimal_field(filter, "minQty").ok().map(Size::new);
                rules.max_qty = decimal_field(filter, "maxQty").ok().map(Size::new);
            }
            Some("PRICE_FILTER") => {
                rules.tick_size = decimal_field(filter, "tickSize").ok().map(Price::new);
            }
            _ => {}
        }
    }
    Ok(rules)
}
