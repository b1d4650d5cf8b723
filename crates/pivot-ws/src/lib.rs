//! Streaming price source.
//!
//! Provides a single-symbol ticker stream with:
//! - Automatic reconnection with a fixed delay and a bounded attempt count
//! - A terminal event once the bound is exhausted
//! - `last_price` / `is_connected` views for status reporting
//! - A [`PriceFeed`] seam so the stop-loss monitor can run against a manual feed

pub mod error;
pub mod feed;
pub mod message;
pub mod price_stream;

pub use error::{WsError, WsResult};
pub use feed::{ManualPriceFeed, PriceFeed, StreamEvent};
pub use message::{decode_ticker, TickerUpdate};
pub use price_stream::{PriceStream, PriceStreamConfig};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any TLS connection is made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
