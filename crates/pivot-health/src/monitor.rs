//! Periodic health checks.
//!
//! Every check records uptime, resident memory and request counters, and
//! every `self_test_interval_secs` probes the local HTTP listener: a TCP
//! connect followed by `GET <health_path>` expecting `{"status":"ok"}`.
//!
//! Unhealthy checks accumulate. A restart is requested only when a critical
//! threshold is crossed, which for memory is twice the unhealthy limit.

use crate::error::{HealthError, HealthResult};
use crate::restart::{RestartManager, RestartReason};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pivot_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Checks between two healthy summary log lines.
const SUMMARY_EVERY: u64 = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(target_os = "linux")]
const PAGE_SIZE: u64 = 4096;

fn default_check_interval_secs() -> u64 {
    60
}

fn default_self_test_interval_secs() -> u64 {
    300
}

fn default_max_memory_mb() -> u64 {
    500
}

fn default_max_uptime_hours() -> u64 {
    24
}

fn default_max_failures() -> u32 {
    3
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_self_test_timeout_secs() -> u64 {
    10
}

fn default_restart_grace_secs() -> u64 {
    3
}

fn default_enabled() -> bool {
    true
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_self_test_interval_secs")]
    pub self_test_interval_secs: u64,

    /// Resident memory above this is unhealthy; above twice this restarts.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    #[serde(default = "default_max_uptime_hours")]
    pub max_uptime_hours: u64,

    #[serde(default = "default_max_failures")]
    pub max_self_test_failures: u32,

    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_self_test_timeout_secs")]
    pub self_test_timeout_secs: u64,

    /// Delay between a restart request and the re-exec.
    #[serde(default = "default_restart_grace_secs")]
    pub restart_grace_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            check_interval_secs: default_check_interval_secs(),
            self_test_interval_secs: default_self_test_interval_secs(),
            max_memory_mb: default_max_memory_mb(),
            max_uptime_hours: default_max_uptime_hours(),
            max_self_test_failures: default_max_failures(),
            max_consecutive_failures: default_max_failures(),
            health_path: default_health_path(),
            self_test_timeout_secs: default_self_test_timeout_secs(),
            restart_grace_secs: default_restart_grace_secs(),
        }
    }
}

impl HealthConfig {
    fn max_uptime(&self) -> Duration {
        Duration::from_secs(self.max_uptime_hours.saturating_mul(3600))
    }
}

/// Point-in-time health counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: f64,
    pub memory_mb: Option<f64>,
    pub request_count: u64,
    pub health_check_count: u64,
    pub self_test_failures: u32,
    pub consecutive_failures: u32,
    pub last_request_time: Option<DateTime<Utc>>,
    pub last_self_test: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Health verdict with the problems that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub problems: Vec<String>,
    pub snapshot: HealthSnapshot,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Problems visible in `snapshot`.
pub fn detect_problems(snapshot: &HealthSnapshot, config: &HealthConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if let Some(mb) = snapshot.memory_mb {
        if mb > config.max_memory_mb as f64 {
            problems.push(format!("high memory usage: {mb:.1}MB"));
        }
    }
    if snapshot.uptime_secs > config.max_uptime().as_secs_f64() {
        problems.push(format!(
            "running without restart for {:.1}h",
            snapshot.uptime_secs / 3600.0
        ));
    }
    if snapshot.self_test_failures >= config.max_self_test_failures {
        problems.push(format!("{} failed self-tests", snapshot.self_test_failures));
    }
    if snapshot.consecutive_failures >= config.max_consecutive_failures {
        problems.push(format!(
            "{} consecutive failed health checks",
            snapshot.consecutive_failures
        ));
    }
    problems
}

/// Critical condition in `snapshot` that warrants a restart, if any.
pub fn restart_reason(snapshot: &HealthSnapshot, config: &HealthConfig) -> Option<RestartReason> {
    if snapshot.consecutive_failures >= config.max_consecutive_failures {
        return Some(RestartReason::ConsecutiveFailures {
            count: snapshot.consecutive_failures,
        });
    }
    if let Some(mb) = snapshot.memory_mb {
        if mb > (config.max_memory_mb as f64) * 2.0 {
            return Some(RestartReason::MemoryCritical { memory_mb: mb });
        }
    }
    if snapshot.uptime_secs > config.max_uptime().as_secs_f64() {
        return Some(RestartReason::UptimeExceeded {
            hours: snapshot.uptime_secs / 3600.0,
        });
    }
    if snapshot.self_test_failures >= config.max_self_test_failures {
        return Some(RestartReason::SelfTestFailures {
            count: snapshot.self_test_failures,
        });
    }
    None
}

#[derive(Debug)]
struct Counters {
    request_count: u64,
    last_request_time: Option<DateTime<Utc>>,
    health_check_count: u64,
    self_test_failures: u32,
    consecutive_failures: u32,
    last_self_test: Option<Instant>,
    last_self_test_at: Option<DateTime<Utc>>,
}

/// Process health monitor.
pub struct HealthMonitor {
    config: HealthConfig,
    restart: Arc<RestartManager>,
    self_test_addr: Option<SocketAddr>,
    http: reqwest::Client,
    started: Instant,
    counters: Mutex<Counters>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, restart: Arc<RestartManager>) -> HealthResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.self_test_timeout_secs))
            .build()?;
        Ok(Self {
            config,
            restart,
            self_test_addr: None,
            http,
            started: Instant::now(),
            counters: Mutex::new(Counters {
                request_count: 0,
                last_request_time: None,
                health_check_count: 0,
                self_test_failures: 0,
                consecutive_failures: 0,
                last_self_test: None,
                last_self_test_at: None,
            }),
        })
    }

    /// Probe `addr` during self-tests. Without it self-tests are skipped.
    pub fn with_self_test(mut self, addr: SocketAddr) -> Self {
        self.self_test_addr = Some(addr);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Note a served request. Clears the consecutive failure count.
    pub fn record_request(&self) {
        let mut counters = self.counters.lock();
        counters.request_count += 1;
        counters.last_request_time = Some(Utc::now());
        if counters.consecutive_failures > 0 {
            info!(
                failures = counters.consecutive_failures,
                "Requests flowing again, clearing health failures"
            );
            counters.consecutive_failures = 0;
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let counters = self.counters.lock();
        HealthSnapshot {
            timestamp: Utc::now(),
            uptime_secs: self.started.elapsed().as_secs_f64(),
            memory_mb: resident_memory_bytes().map(|b| b as f64 / (1024.0 * 1024.0)),
            request_count: counters.request_count,
            health_check_count: counters.health_check_count,
            self_test_failures: counters.self_test_failures,
            consecutive_failures: counters.consecutive_failures,
            last_request_time: counters.last_request_time,
            last_self_test: counters.last_self_test_at,
        }
    }

    pub fn status(&self) -> HealthStatus {
        let snapshot = self.snapshot();
        let problems = detect_problems(&snapshot, &self.config);
        HealthStatus {
            status: if problems.is_empty() {
                HealthState::Healthy
            } else {
                HealthState::Unhealthy
            },
            problems,
            snapshot,
        }
    }

    /// Run checks until `cancel` fires or a restart is requested.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.check_interval_secs.max(1));
        info!(
            interval_secs = interval.as_secs(),
            self_test = ?self.self_test_addr,
            "Health monitor started"
        );

        loop {
            self.check_once().await;
            if self.restart.is_requested() {
                info!("Health monitor stopping, restart pending");
                return;
            }

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel.cancelled() => {
                    info!("Health monitor stopped");
                    return;
                }
            }
        }
    }

    /// One health check. Requests a restart on a critical condition.
    pub async fn check_once(&self) -> HealthStatus {
        let check_number = {
            let mut counters = self.counters.lock();
            counters.health_check_count += 1;
            counters.health_check_count
        };

        if self.self_test_due() {
            self.run_self_test().await;
        }

        let status = self.status();
        if let Some(bytes) = resident_memory_bytes() {
            Metrics::memory_bytes(bytes);
        }

        if status.is_healthy() {
            let recovered = {
                let mut counters = self.counters.lock();
                std::mem::take(&mut counters.consecutive_failures)
            };
            if recovered > 0 {
                info!(failures = recovered, "Health checks recovered");
            }
            if check_number % SUMMARY_EVERY == 0 {
                let s = &status.snapshot;
                info!(
                    uptime_hours = s.uptime_secs / 3600.0,
                    memory_mb = ?s.memory_mb,
                    requests = s.request_count,
                    self_test_failures = s.self_test_failures,
                    "Process healthy"
                );
            }
            return status;
        }

        self.counters.lock().consecutive_failures += 1;
        Metrics::health_check_failed();
        warn!(problems = ?status.problems, "Health check found problems");

        let snapshot = self.snapshot();
        if let Some(reason) = restart_reason(&snapshot, &self.config) {
            error!(
                reason = %reason,
                problems = ?status.problems,
                memory_mb = ?snapshot.memory_mb,
                uptime_hours = snapshot.uptime_secs / 3600.0,
                failures = snapshot.consecutive_failures,
                "Critical health condition"
            );
            self.restart.request_restart(reason);
        }
        status
    }

    fn self_test_due(&self) -> bool {
        if self.self_test_addr.is_none() {
            return false;
        }
        let interval = Duration::from_secs(self.config.self_test_interval_secs);
        self.counters
            .lock()
            .last_self_test
            .map_or(true, |t| t.elapsed() >= interval)
    }

    /// Probe the listener and update the failure counter.
    pub async fn run_self_test(&self) {
        let Some(addr) = self.self_test_addr else {
            return;
        };
        {
            let mut counters = self.counters.lock();
            counters.last_self_test = Some(Instant::now());
            counters.last_self_test_at = Some(Utc::now());
        }

        match self.probe(addr).await {
            Ok(()) => {
                let previous = std::mem::take(&mut self.counters.lock().self_test_failures);
                if previous > 0 {
                    info!(failures = previous, "Self-test recovered");
                }
                debug!(%addr, "Self-test passed");
            }
            Err(e) => {
                let failures = {
                    let mut counters = self.counters.lock();
                    counters.self_test_failures += 1;
                    counters.self_test_failures
                };
                Metrics::self_test_failed();
                if failures >= self.config.max_self_test_failures {
                    error!(%addr, failures, error = %e, "Self-test keeps failing, listener unresponsive");
                } else {
                    warn!(%addr, failures, error = %e, "Self-test failed");
                }
            }
        }
    }

    async fn probe(&self, addr: SocketAddr) -> HealthResult<()> {
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| HealthError::SelfTest(format!("connect to {addr} timed out")))??;

        let url = format!("http://{addr}{}", self.config.health_path);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(HealthError::SelfTest(format!(
                "{url} answered {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response.json().await?;
        match body.get("status").and_then(|s| s.as_str()) {
            Some("ok") => Ok(()),
            _ => Err(HealthError::SelfTest(format!("unexpected payload: {body}"))),
        }
    }
}

/// Resident set size from `/proc/self/statm`.
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    parse_statm_resident(&statm).map(|pages| pages * PAGE_SIZE)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_statm_resident(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::MockRestarter;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn snapshot() -> HealthSnapshot {
        HealthSnapshot {
            timestamp: Utc::now(),
            uptime_secs: 60.0,
            memory_mb: Some(100.0),
            request_count: 0,
            health_check_count: 1,
            self_test_failures: 0,
            consecutive_failures: 0,
            last_request_time: None,
            last_self_test: None,
        }
    }

    fn restart_manager() -> Arc<RestartManager> {
        // Never executed in these tests; any call would fail the mock.
        Arc::new(RestartManager::new(
            Box::new(MockRestarter::new()),
            Duration::ZERO,
        ))
    }

    /// Serve one canned HTTP response per connection.
    async fn http_responder(body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    #[test]
    fn test_healthy_snapshot_has_no_problems() {
        let config = HealthConfig::default();
        assert!(detect_problems(&snapshot(), &config).is_empty());
        assert_eq!(restart_reason(&snapshot(), &config), None);
    }

    #[test]
    fn test_memory_over_limit_is_unhealthy_but_not_critical() {
        let config = HealthConfig::default();
        let s = HealthSnapshot {
            memory_mb: Some(700.0),
            ..snapshot()
        };
        assert_eq!(detect_problems(&s, &config).len(), 1);
        assert_eq!(restart_reason(&s, &config), None);

        let critical = HealthSnapshot {
            memory_mb: Some(1001.0),
            ..snapshot()
        };
        assert_eq!(
            restart_reason(&critical, &config),
            Some(RestartReason::MemoryCritical { memory_mb: 1001.0 })
        );
    }

    #[test]
    fn test_restart_thresholds() {
        let config = HealthConfig::default();

        let failing = HealthSnapshot {
            consecutive_failures: 3,
            ..snapshot()
        };
        assert_eq!(
            restart_reason(&failing, &config),
            Some(RestartReason::ConsecutiveFailures { count: 3 })
        );

        let old = HealthSnapshot {
            uptime_secs: 25.0 * 3600.0,
            ..snapshot()
        };
        assert!(matches!(
            restart_reason(&old, &config),
            Some(RestartReason::UptimeExceeded { .. })
        ));

        let unresponsive = HealthSnapshot {
            self_test_failures: 3,
            ..snapshot()
        };
        assert_eq!(
            restart_reason(&unresponsive, &config),
            Some(RestartReason::SelfTestFailures { count: 3 })
        );

        let below = HealthSnapshot {
            self_test_failures: 2,
            consecutive_failures: 2,
            ..snapshot()
        };
        assert_eq!(restart_reason(&below, &config), None);
    }

    #[test]
    fn test_parse_statm() {
        assert_eq!(parse_statm_resident("12345 2560 300 10 0 900 0\n"), Some(2560));
        assert_eq!(parse_statm_resident(""), None);
    }

    #[tokio::test]
    async fn test_critical_check_requests_restart() {
        let restart = restart_manager();
        let config = HealthConfig {
            max_uptime_hours: 0,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config, restart.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let status = monitor.check_once().await;
        assert!(!status.is_healthy());
        assert!(restart.is_requested());
        assert!(matches!(
            restart.reason(),
            Some(RestartReason::UptimeExceeded { .. })
        ));

        // The loop returns immediately once a restart is pending.
        tokio::time::timeout(Duration::from_secs(1), monitor.run(CancellationToken::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_clears_consecutive_failures() {
        let restart = restart_manager();
        let config = HealthConfig {
            max_memory_mb: 0,
            max_consecutive_failures: 10,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(config, restart.clone()).unwrap();
        if resident_memory_bytes().is_none() {
            return;
        }

        monitor.check_once().await;
        monitor.check_once().await;
        assert_eq!(monitor.snapshot().consecutive_failures, 2);

        monitor.record_request();
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.request_count, 1);
        assert!(snapshot.last_request_time.is_some());
    }

    #[tokio::test]
    async fn test_self_test_passes_on_ok_payload() {
        let addr = http_responder(r#"{"status":"ok"}"#).await;
        let monitor = HealthMonitor::new(HealthConfig::default(), restart_manager())
            .unwrap()
            .with_self_test(addr);

        monitor.run_self_test().await;
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.self_test_failures, 0);
        assert!(snapshot.last_self_test.is_some());
    }

    #[tokio::test]
    async fn test_self_test_failures_accumulate() {
        let addr = http_responder(r#"{"status":"degraded"}"#).await;
        let monitor = HealthMonitor::new(HealthConfig::default(), restart_manager())
            .unwrap()
            .with_self_test(addr);

        monitor.run_self_test().await;
        monitor.run_self_test().await;
        assert_eq!(monitor.snapshot().self_test_failures, 2);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);
        let unreachable = HealthMonitor::new(HealthConfig::default(), restart_manager())
            .unwrap()
            .with_self_test(dead);
        unreachable.run_self_test().await;
        assert_eq!(unreachable.snapshot().self_test_failures, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_loop() {
        let monitor = HealthMonitor::new(HealthConfig::default(), restart_manager()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), monitor.run(cancel))
            .await
            .unwrap();
        assert_eq!(monitor.snapshot().health_check_count, 1);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_value(HealthState::Unhealthy).unwrap();
        assert_eq!(json, serde_json::json!("unhealthy"));
    }
}
