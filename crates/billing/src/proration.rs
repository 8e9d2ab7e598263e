//! Proration and tier-based usage pricing
//!
//! Prorated amounts for partial billing periods and graduated tier pricing.
//! All arithmetic is decimal-exact; see [`crate::money`].

use autumn_shared::{TierBound, UsageTier};
use rust_decimal::Decimal;

use crate::error::{BillingError, BillingResult};
use crate::money::{div_rounded, round_internal, INTERNAL_SCALE};

/// One billing period, epoch ms, half-open `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BillingPeriod {
    pub start: i64,
    pub end: i64,
}

impl BillingPeriod {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

/// Prorate `amount` over the remainder of `period` as of `now`:
/// `amount x (end - now) / (end - start)`. `now` at the period start yields
/// the full amount, at or beyond the end yields zero. Negative amounts
/// (credits) prorate the same way.
pub fn apply_proration(now: i64, period: BillingPeriod, amount: Decimal) -> Decimal {
    if period.end <= period.start || now <= period.start {
        return amount;
    }
    if now >= period.end {
        return Decimal::ZERO;
    }

    let remaining = Decimal::from(period.end - now);
    let total = Decimal::from(period.end - period.start);
    round_internal(amount * div_rounded(remaining, total, INTERNAL_SCALE))
}

/// Round usage up to the nearest multiple of `billing_units`
pub fn round_usage(usage: Decimal, billing_units: u32) -> Decimal {
    if billing_units <= 1 {
        return usage;
    }
    let units = Decimal::from(billing_units);
    (usage / units).ceil() * units
}

/// Total charge for `quantity` units under ascending graduated tiers.
/// Tier amounts are per `billing_units` units; the input quantity is rounded
/// up to the nearest billing-units multiple before tiering.
pub fn amount_for_quantity(
    tiers: &[UsageTier],
    billing_units: u32,
    quantity: Decimal,
) -> BillingResult<Decimal> {
    if tiers.is_empty() {
        return Err(BillingError::InvalidRequest(
            "usage price has no tiers".to_string(),
        ));
    }

    let mut remaining = round_usage(quantity.max(Decimal::ZERO), billing_units);
    let mut total = Decimal::ZERO;
    let mut last_bound = Decimal::ZERO;
    let units = Decimal::from(billing_units.max(1));

    for tier in tiers {
        if remaining.is_zero() {
            break;
        }
        let width = match tier.to {
            TierBound::Finite(to) => {
                if to < last_bound {
                    return Err(BillingError::InvalidRequest(
                        "usage tiers must be ascending".to_string(),
                    ));
                }
                let width = to - last_bound;
                last_bound = to;
                width
            }
            TierBound::Infinite => remaining,
        };

        let in_tier = remaining.min(width);
        total += round_internal(in_tier * tier.amount / units);
        remaining -= in_tier;
    }

    if remaining > Decimal::ZERO {
        // Quantity beyond the last finite tier bills at the last tier's rate
        let last = &tiers[tiers.len() - 1];
        total += round_internal(remaining * last.amount / units);
    }

    Ok(round_internal(total))
}

/// Per-unit price applied to usage beyond the allowance: the rate of the
/// tier the current usage falls in
pub fn price_for_overage(tiers: &[UsageTier], usage: Decimal) -> Decimal {
    for tier in tiers {
        match tier.to {
            TierBound::Finite(to) if to < usage => continue,
            _ => return tier.amount,
        }
    }
    tiers.last().map(|t| t.amount).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn period_30d() -> BillingPeriod {
        BillingPeriod::new(0, 30 * DAY_MS)
    }

    #[test]
    fn test_proration_boundaries() {
        let period = period_30d();
        assert_eq!(apply_proration(period.start, period, dec!(30)), dec!(30));
        assert_eq!(apply_proration(period.end, period, dec!(30)), dec!(0));
        assert_eq!(
            apply_proration(period.start + 15 * DAY_MS, period, dec!(30)),
            dec!(15)
        );
    }

    #[test]
    fn test_proration_outside_period_clamps() {
        let period = period_30d();
        assert_eq!(apply_proration(-DAY_MS, period, dec!(30)), dec!(30));
        assert_eq!(apply_proration(period.end + DAY_MS, period, dec!(30)), dec!(0));
    }

    #[test]
    fn test_proration_credit() {
        let period = period_30d();
        let credit = apply_proration(period.start + 15 * DAY_MS, period, dec!(-30));
        assert_eq!(credit, dec!(-15));
    }

    #[test]
    fn test_upgrade_delta_mid_cycle() {
        // $19 -> $49 with 15 of 30 days remaining: charge half the difference
        let period = period_30d();
        let delta = apply_proration(period.start + 15 * DAY_MS, period, dec!(49) - dec!(19));
        assert_eq!(delta, dec!(15));
    }

    #[test]
    fn test_tiered_pricing_fixture() {
        // Tiers [to 500 @ 10, inf @ 5], billing units 100, quantity 800:
        // 500/100 x 10 + 300/100 x 5 = 50 + 15 = 65
        let tiers = vec![
            UsageTier {
                to: TierBound::Finite(dec!(500)),
                amount: dec!(10),
            },
            UsageTier {
                to: TierBound::Infinite,
                amount: dec!(5),
            },
        ];
        let total = amount_for_quantity(&tiers, 100, dec!(800)).unwrap();
        assert_eq!(total, dec!(65));
    }

    #[test]
    fn test_quantity_rounds_up_to_billing_units() {
        let tiers = vec![UsageTier {
            to: TierBound::Infinite,
            amount: dec!(5),
        }];
        // 101 rounds up to 200 units -> 2 x $5
        let total = amount_for_quantity(&tiers, 100, dec!(101)).unwrap();
        assert_eq!(total, dec!(10));
    }

    #[test]
    fn test_quantity_beyond_last_finite_tier() {
        let tiers = vec![UsageTier {
            to: TierBound::Finite(dec!(100)),
            amount: dec!(1),
        }];
        let total = amount_for_quantity(&tiers, 1, dec!(150)).unwrap();
        assert_eq!(total, dec!(150));
    }

    #[test]
    fn test_descending_tiers_rejected() {
        let tiers = vec![
            UsageTier {
                to: TierBound::Finite(dec!(500)),
                amount: dec!(10),
            },
            UsageTier {
                to: TierBound::Finite(dec!(100)),
                amount: dec!(5),
            },
        ];
        assert!(amount_for_quantity(&tiers, 1, dec!(800)).is_err());
    }

    #[test]
    fn test_price_for_overage_picks_current_tier() {
        let tiers = vec![
            UsageTier {
                to: TierBound::Finite(dec!(500)),
                amount: dec!(10),
            },
            UsageTier {
                to: TierBound::Infinite,
                amount: dec!(5),
            },
        ];
        assert_eq!(price_for_overage(&tiers, dec!(200)), dec!(10));
        assert_eq!(price_for_overage(&tiers, dec!(700)), dec!(5));
    }
}
