//! Application wiring and lifecycle.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use pivot_core::Price;
use pivot_exchange::{BinanceFuturesClient, Exchange, PaperExchange, RetryingExchange};
use pivot_health::{HealthMonitor, ProcessRestarter, RestartManager};
use pivot_position::{MonitorSupervisor, PositionReconciler};
use pivot_ws::PriceStream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ExchangeKind};
use crate::error::AppResult;
use crate::handler::SignalHandler;
use crate::server::{self, IpAllowList, ServerState};

/// Quote currency the paper exchange is funded in.
const PAPER_QUOTE: &str = "USDT";

/// Main application.
pub struct Application {
    config: AppConfig,
}

impl Application {
    /// Create a new application from validated configuration.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn build_exchange(&self) -> AppResult<Arc<dyn Exchange>> {
        let exchange = &self.config.exchange;
        let policy = self.config.retry.clone();
        match exchange.kind {
            ExchangeKind::Binance => {
                info!(testnet = exchange.testnet, leverage = exchange.leverage, "Using Binance futures");
                let client = BinanceFuturesClient::new(exchange.binance())?;
                Ok(Arc::new(RetryingExchange::new(client, policy)))
            }
            ExchangeKind::Paper => {
                warn!(balance = %exchange.paper_balance, "Using paper exchange, no real orders");
                let paper = PaperExchange::new(exchange.leverage);
                paper.set_balance(PAPER_QUOTE, exchange.paper_balance);
                for (symbol, price) in &exchange.paper_prices {
                    paper.set_price(symbol, Price::new(*price));
                }
                Ok(Arc::new(RetryingExchange::new(paper, policy)))
            }
        }
    }

    /// Run until Ctrl-C or a restart request. Re-executes the process on a
    /// restart request once everything has been torn down.
    pub async fn run(self) -> AppResult<()> {
        let config = &self.config;
        info!(
            strategy = %config.strategy_registry()?.active().id,
            position_size = %config.reconciler.position_size,
            leverage = config.exchange.leverage,
            "Starting application"
        );

        let exchange = self.build_exchange()?;
        let feed = Arc::new(PriceStream::new(config.price_stream.clone()));
        let monitors = Arc::new(MonitorSupervisor::new(
            exchange.clone(),
            feed,
            config.stop_loss.clone(),
            config.exchange.leverage,
        ));
        let reconciler = PositionReconciler::new(exchange, config.reconciler.clone());
        let handler = Arc::new(SignalHandler::new(
            &config.strategy_registry()?,
            reconciler,
            monitors.clone(),
        ));

        let restart = Arc::new(RestartManager::new(
            Box::new(ProcessRestarter),
            Duration::from_secs(config.health.restart_grace_secs),
        ));

        let listener = TcpListener::bind(config.server.listen_addr()?).await?;
        let local = listener.local_addr()?;
        let health = Arc::new(
            HealthMonitor::new(config.health.clone(), restart.clone())?
                .with_self_test(loopback(local)),
        );

        let shutdown = CancellationToken::new();
        let state = ServerState::new(
            handler,
            health.clone(),
            monitors.clone(),
            IpAllowList::from_config(&config.server)?,
        );
        let server_shutdown = shutdown.clone();
        let mut server_task = tokio::spawn(async move {
            server::serve(listener, state, async move { server_shutdown.cancelled().await }).await
        });

        let health_task = config.health.enabled.then(|| {
            let health = health.clone();
            let cancel = shutdown.clone();
            tokio::spawn(async move { health.run(cancel).await })
        });

        let restart_token = restart.token();
        let mut server_finished = false;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
            () = restart_token.cancelled() => {
                warn!(reason = ?restart.reason(), "Shutting down for restart");
            }
            result = &mut server_task => {
                server_finished = true;
                match result {
                    Ok(Ok(())) => warn!("Webhook server exited"),
                    Ok(Err(e)) => error!(error = %e, "Webhook server failed"),
                    Err(e) => error!(error = %e, "Webhook server task panicked"),
                }
            }
        }

        shutdown.cancel();
        if monitors.stop().await {
            info!("Stop-loss monitor stopped");
        }
        if !server_finished {
            match server_task.await {
                Ok(Err(e)) => error!(error = %e, "Webhook server failed during shutdown"),
                Err(e) => error!(error = %e, "Webhook server task panicked"),
                Ok(Ok(())) => {}
            }
        }
        if let Some(task) = health_task {
            let _ = task.await;
        }

        let snapshot = health.snapshot();
        info!(
            uptime_secs = snapshot.uptime_secs,
            requests = snapshot.request_count,
            health_checks = snapshot.health_check_count,
            "Shutdown complete"
        );

        restart.execute().await;
        Ok(())
    }
}

/// Address the self-test should dial for a listener bound to `addr`.
fn loopback(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        let ip = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, addr.port())
    } else {
        addr
    }
}
