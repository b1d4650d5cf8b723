//! Duplicate-direction filter.
//!
//! Consecutive alerts in the same direction are noise; a change of direction
//! always goes through. There is no time dimension.

use pivot_core::Action;
use serde::Serialize;
use tracing::info;

/// Last accepted direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterState {
    #[default]
    NoSignalYet,
    LastWasBuy,
    LastWasSell,
}

impl FilterState {
    fn last_action(&self) -> Option<Action> {
        match self {
            Self::NoSignalYet => None,
            Self::LastWasBuy => Some(Action::Buy),
            Self::LastWasSell => Some(Action::Sell),
        }
    }

    fn after(action: Action) -> Self {
        match action {
            Action::Buy => Self::LastWasBuy,
            Action::Sell => Self::LastWasSell,
        }
    }
}

/// Per-strategy toggle. Owned by the signal handler, never persisted.
#[derive(Debug, Default)]
pub struct DuplicateFilter {
    state: FilterState,
}

impl DuplicateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Returns `true` and records `action` unless it repeats the last one.
    pub fn should_process(&mut self, action: Action) -> bool {
        if self.state.last_action() == Some(action) {
            info!(action = %action, "Duplicate signal ignored");
            return false;
        }
        self.state = FilterState::after(action);
        true
    }
}
