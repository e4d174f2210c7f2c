//! Decimal step arithmetic: rounding to exchange lot/tick and the
//! three-leg quantity split.
//!
//! The split operates on `qty_total / step` as an integer, divides in
//! integer arithmetic, and converts back, so `qty1 + qty2 + qty3 ==
//! qty_total` holds by construction in step units.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Errors from the three-leg quantity split.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    /// Total quantity rounds to zero step units.
    #[error("quantity too small after rounding: total={total} step={step}")]
    TotalTooSmall { total: Decimal, step: Decimal },
}

fn assert_step(step: Decimal) {
    assert!(step > Decimal::ZERO, "step must be positive, got {step}");
}

/// Round `x` down to a multiple of `step`.
pub fn floor_to_step(x: Decimal, step: Decimal) -> Decimal {
    assert_step(step);
    (x / step).floor() * step
}

/// Round `x` up to a multiple of `step`.
pub fn ceil_to_step(x: Decimal, step: Decimal) -> Decimal {
    assert_step(step);
    (x / step).ceil() * step
}

/// Round `x` to the nearest multiple of `step` (half away from zero).
pub fn round_nearest_to_step(x: Decimal, step: Decimal) -> Decimal {
    assert_step(step);
    (x / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * step
}

/// Number of decimal places implied by a step (tick/lot).
pub fn decimals_from_step(step: Decimal) -> u32 {
    assert_step(step);
    step.normalize().scale()
}

/// Format a price with exactly the precision the tick size implies.
pub fn fmt_price(p: Decimal, tick: Decimal) -> String {
    format!("{:.*}", decimals_from_step(tick) as usize, p)
}

/// Format a quantity respecting the lot step, trimming trailing zeros.
pub fn fmt_qty(q: Decimal, step: Decimal) -> String {
    let s = format!("{:.*}", decimals_from_step(step) as usize, q);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// Format an arbitrary amount without scientific notation, trimming
/// trailing zeros (borrow/repay amounts).
pub fn fmt_amount(amount: Decimal) -> String {
    let s = amount.normalize().to_string();
    if s == "-0" {
        "0".to_string()
    } else {
        s
    }
}

/// Per-leg exit quantities produced by [`split_three_legs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegSplit {
    pub qty1: Decimal,
    pub qty2: Decimal,
    pub qty3: Decimal,
    /// The 50/50/0 degrade fired: no third leg, trailing is off the table.
    pub degraded: bool,
}

impl LegSplit {
    pub fn total(&self) -> Decimal {
        self.qty1 + self.qty2 + self.qty3
    }
}

/// Split a total quantity into three exit legs in integer step units.
///
/// Standard split is 33/33/34 of step units. When either of the first two
/// legs would round to zero, degrade to 50/50/0.
pub fn split_three_legs(qty_total: Decimal, step: Decimal) -> Result<LegSplit, SplitError> {
    assert_step(step);
    assert!(
        !qty_total.is_sign_negative(),
        "quantity must not be negative, got {qty_total}"
    );

    let total_units = (qty_total / step)
        .floor()
        .to_i64()
        .expect("step units exceed i64 range");
    if total_units <= 0 {
        return Err(SplitError::TotalTooSmall {
            total: qty_total,
            step,
        });
    }

    let mut u1 = total_units / 3;
    let mut u2 = total_units / 3;
    let mut u3 = total_units - u1 - u2;
    let mut degraded = false;

    if u1 == 0 || u2 == 0 {
        u1 = total_units / 2;
        u2 = total_units - u1;
        u3 = 0;
        degraded = true;
    }

    // A single step unit cannot make two viable legs either.
    if u1 == 0 || u2 == 0 {
        return Err(SplitError::TotalTooSmall {
            total: qty_total,
            step,
        });
    }

    debug_assert_eq!(u1 + u2 + u3, total_units);

    Ok(LegSplit {
        qty1: Decimal::from(u1) * step,
        qty2: Decimal::from(u2) * step,
        qty3: Decimal::from(u3) * step,
        degraded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_ceil_round() {
        assert_eq!(floor_to_step(dec!(95000.567), dec!(0.01)), dec!(95000.56));
        assert_eq!(ceil_to_step(dec!(95000.561), dec!(0.01)), dec!(95000.57));
        assert_eq!(
            round_nearest_to_step(dec!(95000.565), dec!(0.01)),
            dec!(95000.57)
        );
        // Exact multiples are fixed points.
        assert_eq!(floor_to_step(dec!(95000.56), dec!(0.01)), dec!(95000.56));
        assert_eq!(ceil_to_step(dec!(95000.56), dec!(0.01)), dec!(95000.56));
    }

    #[test]
    #[should_panic(expected = "step must be positive")]
    fn test_zero_step_panics() {
        floor_to_step(dec!(1), Decimal::ZERO);
    }

    #[test]
    fn test_fmt_price() {
        assert_eq!(fmt_price(dec!(95000.5), dec!(0.01)), "95000.50");
        assert_eq!(fmt_price(dec!(95000), dec!(0.01)), "95000.00");
        assert_eq!(fmt_price(dec!(95000.5), dec!(1)), "95001");
    }

    #[test]
    fn test_fmt_qty_trims_zeros() {
        assert_eq!(fmt_qty(dec!(0.00120), dec!(0.00001)), "0.0012");
        assert_eq!(fmt_qty(dec!(3.00000), dec!(0.00001)), "3");
        assert_eq!(fmt_qty(dec!(5), dec!(1)), "5");
    }

    #[test]
    fn test_fmt_amount_no_sci() {
        assert_eq!(fmt_amount(dec!(0.000300)), "0.0003");
        assert_eq!(fmt_amount(Decimal::ZERO), "0");
    }

    #[test]
    fn test_split_standard() {
        // 100 units of 0.00001 -> 33/33/34
        let split = split_three_legs(dec!(0.00100), dec!(0.00001)).unwrap();
        assert_eq!(split.qty1, dec!(0.00033));
        assert_eq!(split.qty2, dec!(0.00033));
        assert_eq!(split.qty3, dec!(0.00034));
        assert!(!split.degraded);
        assert_eq!(split.total(), dec!(0.00100));
    }

    #[test]
    fn test_split_sum_equals_total_in_step_units() {
        let step = dec!(0.00001);
        for units in [1i64, 2, 3, 4, 5, 7, 10, 99, 100, 101, 1000] {
            let total = Decimal::from(units) * step;
            let split = split_three_legs(total, step).unwrap();
            assert_eq!(split.total(), total, "units={units}");
        }
    }

    #[test]
    fn test_split_degrades_to_two_legs() {
        // 2 units cannot make three viable legs -> 50/50/0.
        let split = split_three_legs(dec!(0.00002), dec!(0.00001)).unwrap();
        assert_eq!(split.qty1, dec!(0.00001));
        assert_eq!(split.qty2, dec!(0.00001));
        assert_eq!(split.qty3, Decimal::ZERO);
        assert!(split.degraded);
    }

    #[test]
    fn test_split_single_unit_rejected() {
        // 1 unit cannot make two viable legs.
        let err = split_three_legs(dec!(0.00001), dec!(0.00001)).unwrap_err();
        assert!(matches!(err, SplitError::TotalTooSmall { .. }));
    }

    #[test]
    fn test_split_zero_total_rejected() {
        let err = split_three_legs(Decimal::ZERO, dec!(0.00001)).unwrap_err();
        assert!(matches!(err, SplitError::TotalTooSmall { .. }));
    }
}
