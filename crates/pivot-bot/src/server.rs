//! Webhook listener using axum.
//!
//! - `POST /webhook`: alert intake, source-address restricted
//! - `GET <health_path>`: liveness probe used by the self-test
//! - `GET /status`: health snapshot and stop-loss monitor state
//! - `GET /metrics`: Prometheus text exposition

use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use pivot_health::HealthMonitor;
use pivot_position::MonitorSupervisor;
use pivot_signal::SignalError;
use pivot_telemetry::Metrics;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::handler::SignalHandler;

/// Alert fields checked, in order, when the body is a JSON object.
const MESSAGE_FIELDS: [&str; 3] = ["message", "text", "alert"];

/// Source-address filter for the webhook.
#[derive(Debug, Clone)]
pub struct IpAllowList {
    allow_any: bool,
    allowed: HashSet<IpAddr>,
}

impl IpAllowList {
    pub fn from_config(config: &ServerConfig) -> AppResult<Self> {
        let allowed = config
            .allowed_ips
            .iter()
            .map(|ip| {
                ip.trim()
                    .parse::<IpAddr>()
                    .map_err(|e| AppError::Config(format!("Invalid allowed IP {ip:?}: {e}")))
            })
            .collect::<AppResult<HashSet<_>>>()?;
        Ok(Self {
            allow_any: config.allow_any_ip,
            allowed,
        })
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.allow_any || self.allowed.contains(&ip)
    }
}

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct ServerState {
    handler: Arc<SignalHandler>,
    health: Arc<HealthMonitor>,
    monitors: Arc<MonitorSupervisor>,
    access: Arc<IpAllowList>,
}

impl ServerState {
    pub fn new(
        handler: Arc<SignalHandler>,
        health: Arc<HealthMonitor>,
        monitors: Arc<MonitorSupervisor>,
        access: IpAllowList,
    ) -> Self {
        Self {
            handler,
            health,
            monitors,
            access: Arc::new(access),
        }
    }
}

/// Create the axum router.
pub fn create_router(state: ServerState) -> Router {
    let health_path = state.health.config().health_path.clone();
    Router::new()
        .route("/webhook", post(webhook))
        .route(&health_path, get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "Webhook server listening");

    let app = create_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("Webhook server stopped");
    Ok(())
}

async fn webhook(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.health.record_request();

    let ip = client_ip(&headers, peer);
    if !state.access.allows(ip) {
        warn!(%ip, "Webhook from unlisted address rejected");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"status": "error", "message": "forbidden"})),
        )
            .into_response();
    }

    let body = match std::str::from_utf8(&body) {
        Ok(body) => body,
        Err(e) => {
            let error = SignalError::Parse(format!("alert body is not valid UTF-8: {e}"));
            return Json(state.handler.reject(error)).into_response();
        }
    };
    let message = extract_message(body);
    debug!(%ip, message = %message, "Webhook received");
    Json(state.handler.handle(&message).await).into_response()
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn status(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "health": state.health.status(),
        "monitor": state.monitors.status(),
    }))
}

async fn metrics() -> Response {
    match Metrics::gather_text() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Originating client address: first `X-Forwarded-For` hop, then
/// `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    };
    forwarded.or_else(real).unwrap_or_else(|| peer.ip())
}

/// Alert text from a webhook body.
///
/// JSON objects yield their first string `message`/`text`/`alert` field, or
/// the raw body when none is present. A JSON string is unwrapped. Anything
/// else is taken as plain text.
pub fn extract_message(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => MESSAGE_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| body.trim().to_string()),
        Ok(Value::String(s)) => s.trim().to_string(),
        _ => body.trim().to_string(),
    }
}
