//! Process health monitoring and controlled restart.
//!
//! # Key Components
//!
//! - [`HealthMonitor`]: Periodic resource checks and HTTP self-test
//! - [`RestartManager`]: Debounced, one-shot restart request and re-exec
//! - [`Restarter`]: Seam over the process image replacement

pub mod error;
pub mod monitor;
pub mod restart;

pub use error::{HealthError, HealthResult};
pub use monitor::{
    detect_problems, restart_reason, HealthConfig, HealthMonitor, HealthSnapshot, HealthState,
    HealthStatus,
};
pub use restart::{ProcessRestarter, RestartManager, RestartReason, Restarter};
