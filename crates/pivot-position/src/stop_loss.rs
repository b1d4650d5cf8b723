//! Live stop-loss monitoring for one position.
//!
//! Lifecycle: `Idle → WaitingForFill → Active{stop_placed: false} →
//! Active{stop_placed: true} → Stopped`.
//!
//! The monitor waits for the fill to settle, fetches the authoritative
//! position, subscribes to the price feed and recomputes PnL on every tick.
//! Once PnL reaches the profit threshold (percent of margin) a single
//! reduce-only stop is placed at a fixed offset from entry in the position's
//! favour. The stop never trails. Stopping the monitor cancels a resting stop
//! and closes the subscription; failures there are logged only.

use pivot_core::{OrderId, PositionSide, PositionSnapshot, Price, PriceTick, Size};
use pivot_exchange::{Exchange, StopOrderRequest};
use pivot_telemetry::Metrics;
use pivot_ws::{PriceFeed, StreamEvent};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Decimal places used for protective prices when the tick size is unknown.
const FALLBACK_PRICE_DP: u32 = 2;

// ============================================================================
// Config
// ============================================================================

fn default_profit_threshold_pct() -> Decimal {
    dec!(5)
}

fn default_stop_loss_pct() -> Decimal {
    dec!(1.2)
}

fn default_price_gap() -> Decimal {
    dec!(1.0)
}

fn default_position_fetch_delay_ms() -> u64 {
    5_000
}

fn default_status_log_interval_secs() -> u64 {
    30
}

/// Stop-loss parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct StopLossConfig {
    /// PnL percent of margin at which the protective stop is placed.
    #[serde(default = "default_profit_threshold_pct")]
    pub profit_threshold_pct: Decimal,

    /// Stop price offset from entry, percent, in the position's favour.
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,

    /// Absolute distance between the stop price and its limit price.
    #[serde(default = "default_price_gap")]
    pub price_gap: Decimal,

    /// Wait after an open before fetching the filled position.
    #[serde(default = "default_position_fetch_delay_ms")]
    pub position_fetch_delay_ms: u64,

    #[serde(default = "default_status_log_interval_secs")]
    pub status_log_interval_secs: u64,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            profit_threshold_pct: default_profit_threshold_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            price_gap: default_price_gap(),
            position_fetch_delay_ms: default_position_fetch_delay_ms(),
            status_log_interval_secs: default_status_log_interval_secs(),
        }
    }
}

// ============================================================================
// PnL math
// ============================================================================

/// Unrealized PnL in quote currency.
#[must_use]
pub fn unrealized_pnl(side: PositionSide, entry: Price, price: Price, size: Size) -> Decimal {
    let diff = match side {
        PositionSide::Long => price.inner() - entry.inner(),
        PositionSide::Short => entry.inner() - price.inner(),
    };
    diff * size.inner()
}

/// Margin backing a position: notional at entry divided by leverage.
#[must_use]
pub fn margin_used(entry: Price, size: Size, leverage: u32) -> Decimal {
    size.notional(entry) / Decimal::from(leverage.max(1))
}

/// PnL as a percent of margin. `None` when there is no margin to divide by.
#[must_use]
pub fn pnl_percent(pnl: Decimal, margin: Decimal) -> Option<Decimal> {
    if margin.is_zero() {
        return None;
    }
    Some(pnl / margin * Decimal::ONE_HUNDRED)
}

/// Stop and limit prices for a protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProtectivePrices {
    pub stop: Price,
    pub limit: Price,
}

/// Derive the protective stop for a position.
///
/// LONG: stop = entry + `stop_loss_pct`%, limit = stop - `gap`.
/// SHORT: stop = entry - `stop_loss_pct`%, limit = stop + `gap`.
///
/// Both prices are rounded to `tick_size` when known, otherwise to two
/// decimal places.
#[must_use]
pub fn protective_prices(
    side: PositionSide,
    entry: Price,
    stop_loss_pct: Decimal,
    gap: Decimal,
    tick_size: Option<Price>,
) -> ProtectivePrices {
    let round = |p: Price| match tick_size.filter(Price::is_positive) {
        Some(tick) => p.round_to_tick(tick),
        None => p.round_dp(FALLBACK_PRICE_DP),
    };
    let gap = Price::new(gap);

    let (stop, limit) = match side {
        PositionSide::Long => {
            let stop = round(entry.offset_pct(stop_loss_pct));
            (stop, round(stop - gap))
        }
        PositionSide::Short => {
            let stop = round(entry.offset_pct(-stop_loss_pct));
            (stop, round(stop + gap))
        }
    };
    ProtectivePrices { stop, limit }
}

// ============================================================================
// Status
// ============================================================================

/// Monitor lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MonitorPhase {
    #[default]
    Idle,
    WaitingForFill,
    Active {
        stop_placed: bool,
    },
    Stopped,
}

/// Read-only view of the monitor, published on every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStatus {
    pub phase: MonitorPhase,
    pub symbol: Option<String>,
    pub side: Option<PositionSide>,
    pub entry_price: Option<Price>,
    pub size: Option<Size>,
    pub margin_used: Option<Decimal>,
    pub stop_order_id: Option<OrderId>,
    pub stop_price: Option<Price>,
    pub last_price: Option<Price>,
    pub pnl_pct: Option<Decimal>,
    pub stream_connected: bool,
    pub stream_terminated: bool,
}

// ============================================================================
// Monitor
// ============================================================================

/// What to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorRequest {
    pub symbol: String,
    /// Side the signal asked for; the fetched position is authoritative.
    pub expected_side: PositionSide,
}

/// Everything a monitor task needs.
#[derive(Clone)]
pub struct MonitorContext {
    pub exchange: Arc<dyn Exchange>,
    pub feed: Arc<dyn PriceFeed>,
    pub config: StopLossConfig,
    pub leverage: u32,
    pub status: Arc<watch::Sender<MonitorStatus>>,
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    symbol: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// True once the task has exited on its own or after [`stop`].
    ///
    /// [`stop`]: MonitorHandle::stop
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the monitor and wait until its teardown has run.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(symbol = %self.symbol, error = %e, "Stop-loss monitor task ended abnormally");
        }
    }
}

/// Stop-loss monitor entry point.
pub struct StopLossMonitor;

impl StopLossMonitor {
    /// Spawn a monitor task for `request`.
    pub fn spawn(ctx: MonitorContext, request: MonitorRequest) -> MonitorHandle {
        let token = CancellationToken::new();
        let symbol = request.symbol.clone();
        let handle = tokio::spawn(run_monitor(ctx, request, token.clone()));
        MonitorHandle {
            symbol,
            token,
            handle,
        }
    }
}

struct Watched {
    position: PositionSnapshot,
    margin: Decimal,
    tick_size: Option<Price>,
    stop: Option<OrderId>,
    last_log: Option<Instant>,
}

async fn run_monitor(ctx: MonitorContext, request: MonitorRequest, token: CancellationToken) {
    let symbol = request.symbol.clone();
    ctx.status.send_replace(MonitorStatus {
        phase: MonitorPhase::WaitingForFill,
        symbol: Some(symbol.clone()),
        side: Some(request.expected_side),
        ..Default::default()
    });
    info!(symbol = %symbol, side = %request.expected_side, "Stop-loss monitor waiting for fill");

    let settle = Duration::from_millis(ctx.config.position_fetch_delay_ms);
    tokio::select! {
        () = tokio::time::sleep(settle) => {}
        () = token.cancelled() => {
            finish(&ctx);
            return;
        }
    }

    let fetched = tokio::select! {
        result = ctx.exchange.get_position(&symbol) => result,
        () = token.cancelled() => {
            finish(&ctx);
            return;
        }
    };
    let position = match fetched {
        Ok(Some(position)) => position,
        Ok(None) => {
            error!(symbol = %symbol, "No filled position found, stop-loss monitor ending");
            finish(&ctx);
            return;
        }
        Err(e) => {
            error!(symbol = %symbol, error = %e, "Position fetch failed, stop-loss monitor ending");
            finish(&ctx);
            return;
        }
    };
    if position.side != request.expected_side {
        warn!(
            symbol = %symbol,
            expected = %request.expected_side,
            actual = %position.side,
            "Filled position side differs from signal, monitoring the live side"
        );
    }

    let tick_size = match ctx.exchange.get_instrument_rules(&symbol).await {
        Ok(rules) => rules.tick_size,
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "Instrument rules unavailable, rounding stops to 2dp");
            None
        }
    };

    let mut rx = match ctx.feed.subscribe(&symbol).await {
        Ok(rx) => rx,
        Err(e) => {
            error!(symbol = %symbol, error = %e, "Price feed subscribe failed, stop-loss monitor ending");
            finish(&ctx);
            return;
        }
    };

    let margin = margin_used(position.entry_price, position.size, ctx.leverage);
    ctx.status.send_modify(|s| {
        s.phase = MonitorPhase::Active { stop_placed: false };
        s.side = Some(position.side);
        s.entry_price = Some(position.entry_price);
        s.size = Some(position.size);
        s.margin_used = Some(margin);
    });
    info!(
        symbol = %symbol,
        side = %position.side,
        entry = %position.entry_price,
        size = %position.size,
        margin = %margin,
        threshold_pct = %ctx.config.profit_threshold_pct,
        "Stop-loss monitor active"
    );

    let mut watched = Watched {
        position,
        margin,
        tick_size,
        stop: None,
        last_log: None,
    };
    let mut stream_alive = true;

    loop {
        tokio::select! {
            () = token.cancelled() => break,

            event = rx.recv(), if stream_alive => match event {
                Some(StreamEvent::Tick(tick)) => on_tick(&ctx, &mut watched, &tick).await,
                Some(StreamEvent::Terminated { reason }) => {
                    stream_alive = false;
                    stream_lost(&ctx, &watched, &reason);
                }
                None => {
                    stream_alive = false;
                    stream_lost(&ctx, &watched, "feed closed");
                }
            },
        }
    }

    teardown(&ctx, &watched).await;
}

async fn on_tick(ctx: &MonitorContext, watched: &mut Watched, tick: &PriceTick) {
    let position = &watched.position;
    let pnl = unrealized_pnl(position.side, position.entry_price, tick.price, position.size);
    let pct = pnl_percent(pnl, watched.margin);

    ctx.status.send_modify(|s| {
        s.last_price = Some(tick.price);
        s.pnl_pct = pct;
        s.stream_connected = ctx.feed.is_connected();
    });
    if let Some(f) = pct.and_then(|p| p.to_f64()) {
        Metrics::position_pnl_pct(f);
    }

    let interval = Duration::from_secs(ctx.config.status_log_interval_secs);
    if watched.last_log.map_or(true, |t| t.elapsed() >= interval) {
        watched.last_log = Some(Instant::now());
        info!(
            symbol = %position.symbol,
            price = %tick.price,
            pnl = %pnl,
            pnl_pct = ?pct,
            stop_order = ?watched.stop.as_ref().map(OrderId::as_str),
            "Position status"
        );
    }

    if watched.stop.is_some() {
        return;
    }
    let Some(pct) = pct else {
        return;
    };
    if pct < ctx.config.profit_threshold_pct {
        return;
    }

    let prices = protective_prices(
        position.side,
        position.entry_price,
        ctx.config.stop_loss_pct,
        ctx.config.price_gap,
        watched.tick_size,
    );
    let request = StopOrderRequest {
        symbol: position.symbol.clone(),
        side: position.side.closing_action(),
        quantity: position.size,
        stop_price: prices.stop,
        limit_price: prices.limit,
    };
    info!(
        symbol = %request.symbol,
        pnl_pct = %pct,
        stop = %prices.stop,
        limit = %prices.limit,
        side = %request.side,
        "Profit threshold reached, placing protective stop"
    );

    match ctx.exchange.place_stop_order(&request).await {
        Ok(order_id) => {
            info!(symbol = %request.symbol, order_id = %order_id, "Protective stop placed");
            Metrics::stop_order_placed();
            ctx.status.send_modify(|s| {
                s.phase = MonitorPhase::Active { stop_placed: true };
                s.stop_order_id = Some(order_id.clone());
                s.stop_price = Some(prices.stop);
            });
            watched.stop = Some(order_id);
        }
        Err(e) => {
            // The next qualifying tick tries again.
            error!(symbol = %request.symbol, error = %e, "Protective stop placement failed");
            Metrics::stop_order_failed();
        }
    }
}

fn stream_lost(ctx: &MonitorContext, watched: &Watched, reason: &str) {
    error!(
        symbol = %watched.position.symbol,
        reason,
        stop_order = ?watched.stop.as_ref().map(OrderId::as_str),
        "Price stream lost, position unprotected by live monitoring"
    );
    ctx.status.send_modify(|s| {
        s.stream_connected = false;
        s.stream_terminated = true;
    });
}

async fn teardown(ctx: &MonitorContext, watched: &Watched) {
    let symbol = &watched.position.symbol;

    if let Some(order_id) = &watched.stop {
        match ctx.exchange.cancel_order(symbol, order_id).await {
            Ok(true) => {
                info!(symbol = %symbol, order_id = %order_id, "Protective stop cancelled");
                Metrics::stop_cancel("cancelled");
            }
            Ok(false) => {
                debug!(symbol = %symbol, order_id = %order_id, "Protective stop already gone");
                Metrics::stop_cancel("not_found");
            }
            Err(e) => {
                error!(symbol = %symbol, order_id = %order_id, error = %e, "Protective stop cancel failed");
                Metrics::stop_cancel("failed");
            }
        }
    }

    ctx.feed.unsubscribe().await;
    Metrics::position_closed();
    finish(ctx);
    info!(symbol = %symbol, "Stop-loss monitor stopped");
}

fn finish(ctx: &MonitorContext) {
    ctx.status.send_modify(|s| {
        s.phase = MonitorPhase::Stopped;
        s.stop_order_id = None;
        s.stream_connected = false;
    });
}
