//! Prometheus metrics for the pivot reversal bot.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a programming error that should crash at
//! startup. These panics only occur during static initialization.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

/// Inbound alerts by handler outcome.
/// Labels: outcome (ignored/success/error)
pub static SIGNALS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pivot_signals_total",
        "Inbound alerts by handler outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Reconciliation decisions.
/// Labels: action (opened/skipped/reversed/failed)
pub static RECONCILE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pivot_reconcile_total",
        "Reconciliation decisions by action",
        &["action"]
    )
    .unwrap()
});

/// Protective stop order submissions.
/// Labels: result (placed/failed)
pub static STOP_ORDERS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pivot_stop_orders_total",
        "Protective stop order submissions by result",
        &["result"]
    )
    .unwrap()
});

/// Protective stop cancellations on monitor teardown.
/// Labels: result (cancelled/not_found/failed)
pub static STOP_CANCELS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pivot_stop_cancels_total",
        "Protective stop cancellations by result",
        &["result"]
    )
    .unwrap()
});

/// Price stream connection state (1 = connected).
pub static PRICE_STREAM_CONNECTED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "pivot_price_stream_connected",
        "Price stream connection state (1=connected)"
    )
    .unwrap()
});

/// Price stream reconnect attempts.
pub static PRICE_STREAM_RECONNECTS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "pivot_price_stream_reconnects_total",
        "Price stream reconnect attempts"
    )
    .unwrap()
});

/// Price streams that exhausted their reconnect budget.
pub static PRICE_STREAM_TERMINATED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "pivot_price_stream_terminated_total",
        "Price streams that gave up reconnecting"
    )
    .unwrap()
});

/// Unrealized PnL of the monitored position, percent of margin.
pub static POSITION_PNL_PCT: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "pivot_position_pnl_pct",
        "Unrealized PnL of the monitored position as percent of margin"
    )
    .unwrap()
});

/// Failed health checks.
pub static HEALTH_CHECK_FAILURES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "pivot_health_check_failures_total",
        "Health checks that found the process unhealthy"
    )
    .unwrap()
});

/// Failed self-tests.
pub static SELF_TEST_FAILURES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "pivot_self_test_failures_total",
        "Self-tests against the local HTTP listener that failed"
    )
    .unwrap()
});

/// Resident memory in bytes.
pub static MEMORY_BYTES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("pivot_memory_bytes", "Resident memory in bytes").unwrap()
});

/// Restart requests.
/// Labels: reason
pub static RESTART_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "pivot_restart_requests_total",
        "Process restart requests by reason",
        &["reason"]
    )
    .unwrap()
});

/// Metrics helper.
pub struct Metrics;

impl Metrics {
    pub fn signal_outcome(outcome: &str) {
        SIGNALS_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn reconcile(action: &str) {
        RECONCILE_TOTAL.with_label_values(&[action]).inc();
    }

    pub fn stop_order_placed() {
        STOP_ORDERS_TOTAL.with_label_values(&["placed"]).inc();
    }

    pub fn stop_order_failed() {
        STOP_ORDERS_TOTAL.with_label_values(&["failed"]).inc();
    }

    pub fn stop_cancel(result: &str) {
        STOP_CANCELS_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn price_stream_connected() {
        PRICE_STREAM_CONNECTED.set(1.0);
    }

    pub fn price_stream_disconnected() {
        PRICE_STREAM_CONNECTED.set(0.0);
    }

    pub fn price_stream_reconnect() {
        PRICE_STREAM_RECONNECTS.inc();
    }

    pub fn price_stream_terminated() {
        PRICE_STREAM_TERMINATED.inc();
        PRICE_STREAM_CONNECTED.set(0.0);
    }

    /// Set the live PnL gauge. Values that do not fit an `f64` are skipped.
    pub fn position_pnl_pct(pct: f64) {
        if pct.is_finite() {
            POSITION_PNL_PCT.set(pct);
        }
    }

    pub fn position_closed() {
        POSITION_PNL_PCT.set(0.0);
    }

    pub fn health_check_failed() {
        HEALTH_CHECK_FAILURES.inc();
    }

    pub fn self_test_failed() {
        SELF_TEST_FAILURES.inc();
    }

    pub fn memory_bytes(bytes: u64) {
        MEMORY_BYTES.set(bytes as f64);
    }

    pub fn restart_requested(reason: &str) {
        RESTART_REQUESTS.with_label_values(&[reason]).inc();
    }

    /// Text exposition of every registered metric.
    pub fn gather_text() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
