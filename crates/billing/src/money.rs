//! Decimal money utilities
//!
//! All currency and fractional-usage arithmetic goes through exact decimal
//! representation. Proration chains multiply and divide repeatedly; a single
//! f64 round-trip anywhere in that chain produces cent-level drift across a
//! billing period.

use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places used for intermediate billing computation
pub const INTERNAL_SCALE: u32 = 10;

/// Decimal places used for currency display / invoicing
pub const CURRENCY_SCALE: u32 = 2;

/// Round to internal precision (10 dp, half-up)
pub fn round_internal(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(INTERNAL_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to currency precision (2 dp, half-up)
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Exact division, rounded to `scale` decimal places (half-up).
/// Division by zero yields zero rather than panicking; callers treat an
/// empty billing period as a zero-amount proration.
pub fn div_rounded(numerator: Decimal, denominator: Decimal, scale: u32) -> Decimal {
    if denominator.is_zero() {
        return Decimal::ZERO;
    }
    (numerator / denominator).round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

/// Currency amount to provider minor units (cents), rounded half-up
pub fn to_minor_units(amount: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    round_currency(amount * Decimal::ONE_HUNDRED)
        .to_i64()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_currency_half_up() {
        assert_eq!(round_currency(dec!(1.005)), dec!(1.01));
        assert_eq!(round_currency(dec!(1.004)), dec!(1.00));
        assert_eq!(round_currency(dec!(-1.005)), dec!(-1.01));
    }

    #[test]
    fn test_div_rounded_internal_precision() {
        let result = div_rounded(dec!(1), dec!(3), INTERNAL_SCALE);
        assert_eq!(result, dec!(0.3333333333));
    }

    #[test]
    fn test_div_by_zero_is_zero() {
        assert_eq!(div_rounded(dec!(10), Decimal::ZERO, 2), Decimal::ZERO);
    }

    #[test]
    fn test_to_minor_units() {
        assert_eq!(to_minor_units(dec!(19.99)), 1999);
        assert_eq!(to_minor_units(dec!(0.005)), 1);
    }

    #[test]
    fn test_no_float_drift_across_chain() {
        // 0.1 + 0.2 == 0.3 exactly, unlike f64
        let sum = dec!(0.1) + dec!(0.2);
        assert_eq!(sum, dec!(0.3));

        // Repeated add/subtract of a cent amount stays exact
        let mut balance = dec!(100);
        for _ in 0..1_000 {
            balance -= dec!(0.01);
        }
        assert_eq!(balance, dec!(90));
    }
}
