//! One-shot process restart.
//!
//! A restart request flips a latch and cancels the shared restart token so
//! every task watching it can wind down. The owner of the process then calls
//! [`RestartManager::execute`], which waits the grace delay and replaces the
//! process image. A failed re-exec ends the process with exit code 1.

use crate::error::{HealthError, HealthResult};
use parking_lot::Mutex;
use pivot_telemetry::Metrics;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Why a restart was requested.
#[derive(Debug, Clone, PartialEq)]
pub enum RestartReason {
    ConsecutiveFailures { count: u32 },
    MemoryCritical { memory_mb: f64 },
    UptimeExceeded { hours: f64 },
    SelfTestFailures { count: u32 },
    Manual(String),
}

impl RestartReason {
    /// Low-cardinality metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ConsecutiveFailures { .. } => "consecutive_failures",
            Self::MemoryCritical { .. } => "memory",
            Self::UptimeExceeded { .. } => "uptime",
            Self::SelfTestFailures { .. } => "self_test",
            Self::Manual(_) => "manual",
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsecutiveFailures { count } => write!(f, "{count} consecutive failed health checks"),
            Self::MemoryCritical { memory_mb } => write!(f, "memory at {memory_mb:.1}MB"),
            Self::UptimeExceeded { hours } => write!(f, "uptime {hours:.1}h over limit"),
            Self::SelfTestFailures { count } => write!(f, "{count} failed self-tests"),
            Self::Manual(reason) => f.write_str(reason),
        }
    }
}

/// Replaces the running process.
#[cfg_attr(test, mockall::automock)]
pub trait Restarter: Send + Sync {
    /// Replace the process image with a fresh copy of itself.
    /// Only returns when that failed.
    fn reexec(&self) -> HealthResult<()>;

    /// Terminate the process immediately.
    fn exit(&self, code: i32);
}

/// Re-executes the current binary with its original arguments.
#[derive(Debug, Default)]
pub struct ProcessRestarter;

impl Restarter for ProcessRestarter {
    #[cfg(unix)]
    fn reexec(&self) -> HealthResult<()> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe()?;
        let args: Vec<_> = std::env::args_os().skip(1).collect();
        info!(exe = %exe.display(), args = ?args, "Re-executing process");
        let err = std::process::Command::new(&exe).args(&args).exec();
        Err(HealthError::Reexec(err.to_string()))
    }

    #[cfg(not(unix))]
    fn reexec(&self) -> HealthResult<()> {
        let exe = std::env::current_exe()?;
        let args: Vec<_> = std::env::args_os().skip(1).collect();
        info!(exe = %exe.display(), args = ?args, "Spawning replacement process");
        std::process::Command::new(&exe)
            .args(&args)
            .spawn()
            .map_err(|e| HealthError::Reexec(e.to_string()))?;
        std::process::exit(0);
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Debounced restart coordinator.
pub struct RestartManager {
    requested: AtomicBool,
    reason: Mutex<Option<RestartReason>>,
    token: CancellationToken,
    grace: Duration,
    restarter: Box<dyn Restarter>,
}

impl RestartManager {
    pub fn new(restarter: Box<dyn Restarter>, grace: Duration) -> Self {
        Self {
            requested: AtomicBool::new(false),
            reason: Mutex::new(None),
            token: CancellationToken::new(),
            grace,
            restarter,
        }
    }

    /// Request a restart. Only the first request is honoured; later ones
    /// return `false`.
    pub fn request_restart(&self, reason: RestartReason) -> bool {
        if self
            .requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(reason = %reason, "Restart already requested, ignoring");
            return false;
        }

        error!(reason = %reason, "Process restart requested");
        Metrics::restart_requested(reason.label());
        *self.reason.lock() = Some(reason);
        self.token.cancel();
        true
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<RestartReason> {
        self.reason.lock().clone()
    }

    /// Cancelled once a restart has been requested.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait the grace delay, then replace the process.
    ///
    /// No-op when no restart was requested. In production this does not
    /// return: either the image is replaced or the process exits.
    pub async fn execute(&self) {
        if !self.is_requested() {
            return;
        }

        info!(grace_secs = self.grace.as_secs_f64(), "Restarting after grace delay");
        tokio::time::sleep(self.grace).await;

        if let Err(e) = self.restarter.reexec() {
            error!(error = %e, "Restart failed, forcing exit");
            self.restarter.exit(1);
        }
    }
}
