//! Price feed seam between the stop-loss monitor and its price source.

use crate::error::{WsError, WsResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use pivot_core::{Price, PriceTick};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Channel capacity between a feed and its subscriber.
pub(crate) const EVENT_BUFFER: usize = 256;

/// Item delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Tick(PriceTick),
    /// The feed gave up; no further ticks will arrive on this subscription.
    Terminated { reason: String },
}

/// Restartable single-symbol price source.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Start streaming `symbol`. Fails while another subscription is live.
    async fn subscribe(&self, symbol: &str) -> WsResult<mpsc::Receiver<StreamEvent>>;

    /// Stop the current subscription, if any, and wait for it to wind down.
    async fn unsubscribe(&self);

    fn last_price(&self) -> Option<Price>;

    /// True when a tick arrived recently.
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Default)]
struct ManualState {
    sender: Option<mpsc::Sender<StreamEvent>>,
    symbol: Option<String>,
    last_price: Option<Price>,
    subscribe_count: u32,
    unsubscribe_count: u32,
}

/// Feed driven by hand: ticks are pushed by the caller.
///
/// Used by tests and by paper runs that replay prices.
#[derive(Debug, Default)]
pub struct ManualPriceFeed {
    state: Mutex<ManualState>,
}

impl ManualPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a tick to the current subscriber. Returns `false` when nobody
    /// is subscribed or the subscriber went away.
    pub async fn push(&self, price: Price) -> bool {
        let (sender, symbol) = {
            let mut state = self.state.lock();
            state.last_price = Some(price);
            (state.sender.clone(), state.symbol.clone())
        };
        match (sender, symbol) {
            (Some(tx), Some(symbol)) => tx
                .send(StreamEvent::Tick(PriceTick::now(symbol, price)))
                .await
                .is_ok(),
            _ => false,
        }
    }

    /// Deliver the terminal event and drop the sender.
    pub async fn terminate(&self, reason: &str) -> bool {
        let sender = self.state.lock().sender.take();
        match sender {
            Some(tx) => tx
                .send(StreamEvent::Terminated {
                    reason: reason.to_string(),
                })
                .await
                .is_ok(),
            None => false,
        }
    }

    pub fn subscribed_symbol(&self) -> Option<String> {
        let state = self.state.lock();
        state.sender.as_ref().and(state.symbol.clone())
    }

    pub fn subscribe_count(&self) -> u32 {
        self.state.lock().subscribe_count
    }

    pub fn unsubscribe_count(&self) -> u32 {
        self.state.lock().unsubscribe_count
    }

    /// Poll until a subscriber is attached or `timeout` passes.
    pub async fn wait_for_subscriber(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.subscribed_symbol().is_some() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl PriceFeed for ManualPriceFeed {
    async fn subscribe(&self, symbol: &str) -> WsResult<mpsc::Receiver<StreamEvent>> {
        let mut state = self.state.lock();
        if let Some(tx) = &state.sender {
            if !tx.is_closed() {
                return Err(WsError::AlreadyRunning(
                    state.symbol.clone().unwrap_or_default(),
                ));
            }
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        state.sender = Some(tx);
        state.symbol = Some(symbol.to_string());
        state.subscribe_count += 1;
        debug!(symbol, "Manual feed subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self) {
        let mut state = self.state.lock();
        state.sender = None;
        state.unsubscribe_count += 1;
    }

    fn last_price(&self) -> Option<Price> {
        self.state.lock().last_price
    }

    fn is_connected(&self) -> bool {
        self.state.lock().sender.is_some()
    }
}
