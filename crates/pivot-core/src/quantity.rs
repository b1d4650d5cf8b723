//! Pure quantity sizing against instrument lot rules.
//!
//! Exchange bindings compose these instead of carrying their own rounding.

use crate::decimal::{Price, Size};
use crate::error::{CoreError, Result};
use crate::types::InstrumentRules;
use rust_decimal::Decimal;

/// Decimal places used when an instrument publishes neither a step nor a
/// precision.
pub const FALLBACK_QTY_DP: u32 = 3;

/// Round a raw quantity to the instrument's lot rules.
///
/// Step wins over precision, precision over the 3dp fallback. The result is
/// lifted to `min_qty` when rounding lands below it.
pub fn round_quantity(raw: Size, rules: &InstrumentRules) -> Size {
    let rounded = match (rules.qty_step, rules.qty_precision) {
        (Some(step), _) if step.is_positive() => raw.round_to_step(step),
        (_, Some(dp)) => raw.round_dp(dp),
        _ => raw.round_dp(FALLBACK_QTY_DP),
    };

    match rules.min_qty {
        Some(min) if min.is_positive() && rounded < min => min,
        _ => rounded,
    }
}

/// Check `qty` against the instrument's min/max bounds.
pub fn check_quantity(qty: Size, rules: &InstrumentRules) -> Result<()> {
    if !qty.is_positive() {
        return Err(CoreError::InvalidQuantity(format!("{qty} is not positive")));
    }
    if let Some(min) = rules.min_qty.filter(Size::is_positive) {
        if qty < min {
            return Err(CoreError::InvalidQuantity(format!(
                "{qty} below minimum {min}"
            )));
        }
    }
    if let Some(max) = rules.max_qty.filter(Size::is_positive) {
        if qty > max {
            return Err(CoreError::InvalidQuantity(format!(
                "{qty} above maximum {max}"
            )));
        }
    }
    Ok(())
}

/// Boolean form of [`check_quantity`].
pub fn validate_quantity(qty: Size, rules: &InstrumentRules) -> bool {
    check_quantity(qty, rules).is_ok()
}

/// Order quantity for a margin amount in quote currency:
/// `margin * leverage / price`, rounded to the lot rules.
pub fn quantity_for_margin(
    margin: Decimal,
    leverage: u32,
    price: Price,
    rules: &InstrumentRules,
) -> Result<Size> {
    if !price.is_positive() {
        return Err(CoreError::InvalidQuantity(format!(
            "cannot size against price {price}"
        )));
    }
    let raw = Size::new(margin * Decimal::from(leverage) / price.inner());
    Ok(round_quantity(raw, rules))
}
