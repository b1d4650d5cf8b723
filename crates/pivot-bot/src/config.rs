//! Application configuration.

use crate::error::{AppError, AppResult};
use pivot_exchange::{BinanceConfig, RetryPolicy};
use pivot_health::HealthConfig;
use pivot_position::{ReconcilerConfig, StopLossConfig};
use pivot_signal::{StrategyRegistration, StrategyRegistry};
use pivot_ws::PriceStreamConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::SocketAddr;
use zeroize::Zeroizing;

/// Config path used when neither `--config` nor `PIVOT_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

pub const CONFIG_ENV: &str = "PIVOT_CONFIG";
pub const API_KEY_ENV: &str = "PIVOT_API_KEY";
pub const API_SECRET_ENV: &str = "PIVOT_API_SECRET";

// ============================================================================
// Server
// ============================================================================

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    80
}

/// TradingView webhook source addresses.
fn default_allowed_ips() -> Vec<String> {
    [
        "52.89.214.238",
        "34.212.75.30",
        "54.218.53.128",
        "52.32.178.7",
        "194.156.99.37",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Webhook listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Client addresses allowed to post alerts.
    #[serde(default = "default_allowed_ips")]
    pub allowed_ips: Vec<String>,

    /// Skip the address check entirely.
    #[serde(default)]
    pub allow_any_ip: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_ips: default_allowed_ips(),
            allow_any_ip: false,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> AppResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid listen address: {e}")))
    }
}

// ============================================================================
// Exchange
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    /// In-memory exchange for dry runs.
    #[default]
    Paper,
}

fn default_leverage() -> u32 {
    10
}

fn default_recv_window_ms() -> u64 {
    5_000
}

fn default_paper_balance() -> Decimal {
    Decimal::ONE_THOUSAND
}

fn empty_secret() -> Zeroizing<String> {
    Zeroizing::new(String::new())
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Zeroizing<String>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(Zeroizing::new)
}

/// Exchange selection and credentials.
#[derive(Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default)]
    pub kind: ExchangeKind,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "empty_secret", deserialize_with = "deserialize_secret")]
    pub api_secret: Zeroizing<String>,

    #[serde(default)]
    pub testnet: bool,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,

    /// Overrides the REST endpoint.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Starting quote balance of the paper exchange.
    #[serde(default = "default_paper_balance")]
    pub paper_balance: Decimal,

    /// Mark prices seeded into the paper exchange, by symbol.
    #[serde(default)]
    pub paper_prices: HashMap<String, Decimal>,
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("kind", &self.kind)
            .field("api_key", &"<redacted>")
            .field("testnet", &self.testnet)
            .field("leverage", &self.leverage)
            .field("base_url", &self.base_url)
            .field("paper_balance", &self.paper_balance)
            .finish()
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            kind: ExchangeKind::default(),
            api_key: String::new(),
            api_secret: empty_secret(),
            testnet: false,
            leverage: default_leverage(),
            recv_window_ms: default_recv_window_ms(),
            base_url: None,
            paper_balance: default_paper_balance(),
            paper_prices: HashMap::new(),
        }
    }
}

impl ExchangeConfig {
    pub fn binance(&self) -> BinanceConfig {
        BinanceConfig {
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            testnet: self.testnet,
            leverage: self.leverage,
            recv_window_ms: self.recv_window_ms,
            base_url: self.base_url.clone(),
        }
    }
}

// ============================================================================
// Telemetry
// ============================================================================

/// Logging settings. `RUST_LOG` takes precedence over `log_level`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub log_level: Option<String>,
}

// ============================================================================
// AppConfig
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub strategies: Vec<StrategyRegistration>,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    #[serde(default)]
    pub stop_loss: StopLossConfig,

    #[serde(default)]
    pub price_stream: PriceStreamConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Resolve the config path: CLI flag, then `PIVOT_CONFIG`, then the default.
    pub fn resolve_path(cli: Option<String>) -> String {
        cli.or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load, apply credential overrides from the environment, and validate.
    pub fn load(path: &str) -> AppResult<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_credentials(
            std::env::var(API_KEY_ENV).ok(),
            std::env::var(API_SECRET_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Parse a file without validating.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config {path}: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    /// Replace file credentials with the given overrides, when present.
    pub fn apply_credentials(&mut self, api_key: Option<String>, api_secret: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            self.exchange.api_key = key;
        }
        if let Some(secret) = api_secret.filter(|s| !s.is_empty()) {
            self.exchange.api_secret = Zeroizing::new(secret);
        }
    }

    /// Build the strategy registry; fails unless exactly one is enabled.
    pub fn strategy_registry(&self) -> AppResult<StrategyRegistry> {
        Ok(StrategyRegistry::new(self.strategies.clone())?)
    }

    pub fn validate(&self) -> AppResult<()> {
        self.strategy_registry()?;

        if self.reconciler.position_size <= Decimal::ZERO {
            return Err(AppError::Config("reconciler.position_size must be > 0".into()));
        }
        if self.exchange.leverage < 1 {
            return Err(AppError::Config("exchange.leverage must be >= 1".into()));
        }
        if self.stop_loss.profit_threshold_pct <= Decimal::ZERO {
            return Err(AppError::Config("stop_loss.profit_threshold_pct must be > 0".into()));
        }
        if self.stop_loss.stop_loss_pct <= Decimal::ZERO {
            return Err(AppError::Config("stop_loss.stop_loss_pct must be > 0".into()));
        }
        if self.retry.max_attempts < 1 {
            return Err(AppError::Config("retry.max_attempts must be >= 1".into()));
        }
        if !self.server.allow_any_ip && self.server.allowed_ips.is_empty() {
            return Err(AppError::Config(
                "server.allowed_ips is empty and allow_any_ip is off".into(),
            ));
        }
        if self.exchange.kind == ExchangeKind::Binance
            && (self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty())
        {
            return Err(AppError::Config(format!(
                "Binance credentials missing (set exchange.api_key/api_secret or {API_KEY_ENV}/{API_SECRET_ENV})"
            )));
        }
        self.server.listen_addr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SHIPPED: &str = include_str!("../../../config/default.toml");

    fn minimal() -> AppConfig {
        AppConfig::from_toml(
            r#"
            [[strategies]]
            id = "Pivot"
            enabled = true
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = AppConfig::from_toml(SHIPPED).unwrap();
        config.validate().unwrap();
        assert_eq!(config.strategy_registry().unwrap().active().id, "Pivot");
        assert_eq!(config.stop_loss.stop_loss_pct, dec!(1.2));
        assert_eq!(config.reconciler.position_size, dec!(100));
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = minimal();
        config.validate().unwrap();
        assert_eq!(config.exchange.kind, ExchangeKind::Paper);
        assert_eq!(config.exchange.leverage, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.stop_loss.profit_threshold_pct, dec!(5));
        assert_eq!(config.health.check_interval_secs, 60);
        assert_eq!(config.server.allowed_ips.len(), 5);
        assert_eq!(config.server.listen_addr().unwrap().port(), 80);
    }

    #[test]
    fn test_requires_exactly_one_enabled_strategy() {
        let none = AppConfig::default();
        assert!(matches!(none.validate(), Err(AppError::Signal(_))));

        let two = AppConfig::from_toml(
            r#"
            [[strategies]]
            id = "Pivot"
            enabled = true

            [[strategies]]
            id = "Other"
            enabled = true
            "#,
        )
        .unwrap();
        assert!(matches!(two.validate(), Err(AppError::Signal(_))));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = minimal();
        config.reconciler.position_size = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.server.allowed_ips.clear();
        assert!(config.validate().is_err());
        config.server.allow_any_ip = true;
        assert!(config.validate().is_ok());

        let mut config = minimal();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_binance_needs_credentials() {
        let mut config = minimal();
        config.exchange.kind = ExchangeKind::Binance;
        assert!(config.validate().is_err());

        config.apply_credentials(Some("key".into()), Some("secret".into()));
        assert!(config.validate().is_ok());
        assert_eq!(config.exchange.api_key, "key");
        assert_eq!(config.exchange.api_secret.as_str(), "secret");

        // Empty overrides keep the current values.
        config.apply_credentials(Some(String::new()), None);
        assert_eq!(config.exchange.api_key, "key");
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let mut config = minimal();
        config.apply_credentials(Some("visible-key".into()), Some("hidden-secret".into()));
        let debug = format!("{:?}", config.exchange);
        assert!(!debug.contains("visible-key"));
        assert!(!debug.contains("hidden-secret"));
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        assert_eq!(AppConfig::resolve_path(Some("custom.toml".into())), "custom.toml");
    }
}
