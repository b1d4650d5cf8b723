//! Strategy registrations.

use crate::error::{SignalError, SignalResult};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A strategy alerts may be attributed to.
///
/// The identifier is the exact text an alert carries before its first `:`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRegistration {
    pub id: String,
    #[serde(default)]
    pub enabled: bool,
}

impl StrategyRegistration {
    pub fn new(id: impl Into<String>, enabled: bool) -> Self {
        Self {
            id: id.into(),
            enabled,
        }
    }

    /// Match predicate: the claimed identifier must equal ours exactly
    /// (surrounding whitespace ignored).
    pub fn matches(&self, claimed: &str) -> bool {
        claimed.trim() == self.id
    }
}

/// Validated set of registrations with exactly one enabled entry.
///
/// The single-active rule is checked once at construction, not per signal.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    registrations: Vec<StrategyRegistration>,
    active: usize,
}

impl StrategyRegistry {
    pub fn new(registrations: Vec<StrategyRegistration>) -> SignalResult<Self> {
        let enabled: Vec<usize> = registrations
            .iter()
            .enumerate()
            .filter(|(_, r)| r.enabled)
            .map(|(i, _)| i)
            .collect();

        match enabled.as_slice() {
            [] => Err(SignalError::NoActiveStrategy),
            [active] => {
                info!(strategy = %registrations[*active].id, "Active strategy");
                Ok(Self {
                    active: *active,
                    registrations,
                })
            }
            _ => Err(SignalError::MultipleActiveStrategies(
                enabled
                    .iter()
                    .map(|i| registrations[*i].id.clone())
                    .collect(),
            )),
        }
    }

    pub fn active(&self) -> &StrategyRegistration {
        &self.registrations[self.active]
    }

    pub fn registrations(&self) -> &[StrategyRegistration] {
        &self.registrations
    }
}
