//! Position reconciliation and live stop-loss monitoring.
//!
//! A signal is reconciled against the live exchange position (open, skip or
//! reverse); the resulting position is then watched tick by tick and a
//! reduce-only protective stop is placed once it is far enough in profit.
//!
//! # Key Components
//!
//! - [`PositionReconciler`]: Open / skip / reverse decision and execution
//! - [`StopLossMonitor`]: Background task driving the protective stop state machine
//! - [`MonitorSupervisor`]: Keeps at most one monitor alive and reports its status
//! - [`protective_prices`]: Pure stop/limit price derivation

pub mod error;
pub mod reconciler;
pub mod stop_loss;
pub mod supervisor;

pub use error::{PositionError, PositionResult};
pub use reconciler::{PositionReconciler, ReconcileAction, ReconcilerConfig};
pub use stop_loss::{
    margin_used, pnl_percent, protective_prices, unrealized_pnl, MonitorContext, MonitorHandle,
    MonitorPhase, MonitorRequest, MonitorStatus, ProtectivePrices, StopLossConfig,
    StopLossMonitor,
};
pub use supervisor::MonitorSupervisor;
