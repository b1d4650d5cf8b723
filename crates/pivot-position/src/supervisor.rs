//! Keeps at most one stop-loss monitor alive.

use crate::stop_loss::{
    MonitorContext, MonitorHandle, MonitorRequest, MonitorStatus, StopLossConfig, StopLossMonitor,
};
use pivot_exchange::Exchange;
use pivot_ws::PriceFeed;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// Owner of the single active [`StopLossMonitor`].
///
/// Starting a monitor first stops the previous one and waits for its
/// teardown (stop cancel, feed unsubscribe) before the next one is spawned.
pub struct MonitorSupervisor {
    ctx: MonitorContext,
    current: Mutex<Option<MonitorHandle>>,
}

impl MonitorSupervisor {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        feed: Arc<dyn PriceFeed>,
        config: StopLossConfig,
        leverage: u32,
    ) -> Self {
        let (status, _) = watch::channel(MonitorStatus::default());
        Self {
            ctx: MonitorContext {
                exchange,
                feed,
                config,
                leverage,
                status: Arc::new(status),
            },
            current: Mutex::new(None),
        }
    }

    /// Replace the running monitor with one for `request`.
    pub async fn start(&self, request: MonitorRequest) {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            info!(previous = %previous.symbol(), next = %request.symbol, "Replacing stop-loss monitor");
            previous.stop().await;
        }
        *current = Some(StopLossMonitor::spawn(self.ctx.clone(), request));
    }

    /// Stop the running monitor. Returns `false` when none was running.
    pub async fn stop(&self) -> bool {
        let previous = self.current.lock().await.take();
        match previous {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Latest published status.
    pub fn status(&self) -> MonitorStatus {
        self.ctx.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MonitorStatus> {
        self.ctx.status.subscribe()
    }

    /// True while a monitor task is still running.
    pub async fn is_active(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}
