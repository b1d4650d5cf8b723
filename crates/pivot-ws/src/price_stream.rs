//! Reconnecting single-symbol ticker stream.
//!
//! One background task per subscription. Disconnects and decode errors lead
//! to a reconnect after a fixed delay; the attempt counter resets whenever a
//! connection is established. Once the bound is hit the subscriber receives
//! [`StreamEvent::Terminated`] and the task ends.

use crate::error::{WsError, WsResult};
use crate::feed::{PriceFeed, StreamEvent, EVENT_BUFFER};
use crate::message::decode_ticker;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use pivot_core::{Price, PriceTick};
use pivot_telemetry::Metrics;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

fn default_base_url() -> String {
    "wss://fstream.binance.com/ws".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_stale_after_ms() -> u64 {
    30_000
}

/// Stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PriceStreamConfig {
    /// Stream endpoint; `/<symbol>@ticker` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Reconnects allowed after consecutive failed sessions. A session
    /// that delivers a tick resets the count.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// A stream with no tick for this long reports as disconnected.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
}

impl Default for PriceStreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            stale_after_ms: default_stale_after_ms(),
        }
    }
}

impl PriceStreamConfig {
    pub fn stream_url(&self, symbol: &str) -> String {
        format!(
            "{}/{}@ticker",
            self.base_url.trim_end_matches('/'),
            symbol.to_lowercase()
        )
    }
}

/// State shared between the handle and its background task.
#[derive(Debug, Default)]
struct Shared {
    last_price: RwLock<Option<Price>>,
    last_update: RwLock<Option<Instant>>,
    reconnect_count: RwLock<u32>,
}

struct ActiveStream {
    symbol: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// How one connection ended.
enum SessionEnd {
    Cancelled,
    SubscriberGone,
    Disconnected,
}

/// Reconnecting ticker stream for one symbol at a time.
pub struct PriceStream {
    config: PriceStreamConfig,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveStream>>,
}

impl PriceStream {
    pub fn new(config: PriceStreamConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            active: Mutex::new(None),
        }
    }

    /// Start streaming `symbol`.
    ///
    /// Rejected while a previous stream is still running; call [`stop`] first.
    ///
    /// [`stop`]: PriceStream::stop
    pub fn start(&self, symbol: &str) -> WsResult<mpsc::Receiver<StreamEvent>> {
        let mut active = self.active.lock();
        if let Some(existing) = active.as_ref() {
            if !existing.handle.is_finished() {
                return Err(WsError::AlreadyRunning(existing.symbol.clone()));
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token = CancellationToken::new();
        *self.shared.last_price.write() = None;
        *self.shared.last_update.write() = None;
        *self.shared.reconnect_count.write() = 0;

        let handle = tokio::spawn(run_stream(
            self.config.clone(),
            symbol.to_string(),
            self.shared.clone(),
            tx,
            token.clone(),
        ));

        info!(symbol, "Price stream started");
        *active = Some(ActiveStream {
            symbol: symbol.to_string(),
            token,
            handle,
        });
        Ok(rx)
    }

    /// Cancel the running stream and wait for its task to exit.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        active.token.cancel();
        if let Err(e) = active.handle.await {
            warn!(symbol = %active.symbol, error = %e, "Price stream task ended abnormally");
        }
        info!(symbol = %active.symbol, "Price stream stopped");
    }

    /// Symbol of the running stream.
    pub fn symbol(&self) -> Option<String> {
        self.active
            .lock()
            .as_ref()
            .filter(|a| !a.handle.is_finished())
            .map(|a| a.symbol.clone())
    }

    pub fn last_price(&self) -> Option<Price> {
        *self.shared.last_price.read()
    }

    /// True when a tick arrived within `stale_after_ms`.
    pub fn is_connected(&self) -> bool {
        self.shared
            .last_update
            .read()
            .is_some_and(|t| t.elapsed() < Duration::from_millis(self.config.stale_after_ms))
    }

    /// Failed sessions since the last one that delivered a tick.
    pub fn reconnect_count(&self) -> u32 {
        *self.shared.reconnect_count.read()
    }
}

#[async_trait]
impl PriceFeed for PriceStream {
    async fn subscribe(&self, symbol: &str) -> WsResult<mpsc::Receiver<StreamEvent>> {
        self.start(symbol)
    }

    async fn unsubscribe(&self) {
        self.stop().await;
    }

    fn last_price(&self) -> Option<Price> {
        PriceStream::last_price(self)
    }

    fn is_connected(&self) -> bool {
        PriceStream::is_connected(self)
    }
}

async fn run_stream(
    config: PriceStreamConfig,
    symbol: String,
    shared: Arc<Shared>,
    tx: mpsc::Sender<StreamEvent>,
    token: CancellationToken,
) {
    let url = config.stream_url(&symbol);
    let delay = Duration::from_millis(config.reconnect_delay_ms);

    loop {
        if token.is_cancelled() {
            return;
        }

        let result = run_session(&url, &symbol, &shared, &tx, &token).await;
        Metrics::price_stream_disconnected();

        match result {
            Ok(SessionEnd::Cancelled) => {
                debug!(symbol = %symbol, "Price stream cancelled");
                return;
            }
            Ok(SessionEnd::SubscriberGone) => {
                info!(symbol = %symbol, "Price stream subscriber dropped, stopping");
                return;
            }
            Ok(SessionEnd::Disconnected) => {
                warn!(symbol = %symbol, "Price stream disconnected");
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "Price stream error");
            }
        }

        if token.is_cancelled() {
            return;
        }

        // run_session zeroes the counter once a session delivers a tick, so a
        // server that accepts connections but only sends garbage still runs
        // the counter out.
        let attempt = {
            let mut count = shared.reconnect_count.write();
            *count += 1;
            *count
        };

        if attempt > config.max_reconnect_attempts {
            let err = WsError::ReconnectExhausted {
                attempts: config.max_reconnect_attempts,
            };
            error!(symbol = %symbol, error = %err, "Price stream giving up");
            Metrics::price_stream_terminated();
            let _ = tx
                .send(StreamEvent::Terminated {
                    reason: err.to_string(),
                })
                .await;
            return;
        }

        warn!(symbol = %symbol, attempt, delay_ms = config.reconnect_delay_ms, "Reconnecting price stream");
        Metrics::price_stream_reconnect();
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = token.cancelled() => return,
        }
    }
}

async fn run_session(
    url: &str,
    symbol: &str,
    shared: &Shared,
    tx: &mpsc::Sender<StreamEvent>,
    token: &CancellationToken,
) -> WsResult<SessionEnd> {
    info!(url, "Connecting price stream");

    let connect = connect_async_tls_with_config(url, None, true, None);
    let (ws_stream, _response) = tokio::select! {
        result = connect => result?,
        () = token.cancelled() => return Ok(SessionEnd::Cancelled),
    };
    let (mut write, mut read) = ws_stream.split();

    Metrics::price_stream_connected();
    info!(symbol, "Price stream connected");

    let mut delivered = false;
    loop {
        tokio::select! {
            () = token.cancelled() => {
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!(error = %e, "Failed to send Close frame");
                }
                return Ok(SessionEnd::Cancelled);
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(update) = decode_ticker(&text)? else {
                            continue;
                        };
                        if !delivered {
                            delivered = true;
                            *shared.reconnect_count.write() = 0;
                        }
                        *shared.last_price.write() = Some(update.price);
                        *shared.last_update.write() = Some(Instant::now());

                        let tick = PriceTick {
                            symbol: symbol.to_string(),
                            price: update.price,
                            timestamp: update.timestamp,
                        };
                        if tx.send(StreamEvent::Tick(tick)).await.is_err() {
                            return Ok(SessionEnd::SubscriberGone);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1000, "Normal close".to_string()));
                        return Err(WsError::ConnectionClosed { code, reason });
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(SessionEnd::Disconnected),
                    _ => {}
                }
            }
        }
    }
}
