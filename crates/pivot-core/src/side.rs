//! Signal direction and position direction.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Directional instruction carried by an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    /// Returns the opposite action.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Position side this action leads to once executed.
    pub fn position_side(&self) -> PositionSide {
        match self {
            Self::Buy => PositionSide::Long,
            Self::Sell => PositionSide::Short,
        }
    }

    /// Exchange wire representation (`BUY` / `SELL`).
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for Action {
    type Err = CoreError;

    /// Case-insensitive: `buy`, `BUY` and `Buy` all parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("buy") {
            Ok(Self::Buy)
        } else if s.eq_ignore_ascii_case("sell") {
            Ok(Self::Sell)
        } else {
            Err(CoreError::InvalidAction(s.to_string()))
        }
    }
}

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order action that reduces this position.
    pub fn closing_action(&self) -> Action {
        match self {
            Self::Long => Action::Sell,
            Self::Short => Action::Buy,
        }
    }

    /// Returns 1 for long, -1 for short.
    pub fn sign(&self) -> i8 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }

    /// True when `action` would add to (or re-open) this side.
    pub fn matches(&self, action: Action) -> bool {
        action.position_side() == *self
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse_case_insensitive() {
        assert_eq!("buy".parse::<Action>().unwrap(), Action::Buy);
        assert_eq!("SELL".parse::<Action>().unwrap(), Action::Sell);
        assert_eq!("Buy".parse::<Action>().unwrap(), Action::Buy);
        assert!("hold".parse::<Action>().is_err());
    }

    #[test]
    fn test_side_mapping() {
        assert_eq!(Action::Buy.position_side(), PositionSide::Long);
        assert_eq!(Action::Sell.position_side(), PositionSide::Short);
        assert_eq!(PositionSide::Long.closing_action(), Action::Sell);
        assert_eq!(PositionSide::Short.closing_action(), Action::Buy);
        assert!(PositionSide::Long.matches(Action::Buy));
        assert!(!PositionSide::Short.matches(Action::Buy));
    }
}
