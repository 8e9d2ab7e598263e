//! Interval resets and rollover accounting
//!
//! Pure computation of an entitlement's post-reset state: unused allowance
//! becomes a rollover row with its own expiry, capped with excess cleared
//! oldest-first. The storage layer provides the conflict-free insert; if two
//! resets race, the loser re-reads the winner's row instead of writing a
//! duplicate (see [`crate::storage`]).

use autumn_shared::{CustomerEntitlement, EntityBalance, Rollover, RolloverConfig};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::intervals::add_interval;

/// New entitlement state at an interval reset, plus the rollover row to
/// insert (if any). Applied under the customer lock with a version check.
#[derive(Debug, Clone, PartialEq)]
pub struct ResetOutcome {
    pub balance: Decimal,
    pub entities: HashMap<String, EntityBalance>,
    /// Surviving prior rollovers after expiry and cap clearing
    pub rollovers: Vec<Rollover>,
    /// Row for the conflict-free insert, keyed (entitlement, period)
    pub new_rollover: Option<Rollover>,
    pub next_reset_at: Option<i64>,
}

/// Compute the entitlement's state for the reset scheduled at `reset_at`.
///
/// `reset_balance` is the starting balance for the new period (allowance
/// scaled by product quantity and prepaid options). The adjustment term is
/// zeroed by the reset; `next_reset_at` advances from the scheduled time so
/// late-running resets do not drift the cycle.
pub fn cycle_reset(
    ce: &CustomerEntitlement,
    reset_balance: Decimal,
    reset_at: i64,
    anchor_ms: Option<i64>,
) -> ResetOutcome {
    let mut rollovers = surviving_rollovers(&ce.rollovers, reset_at);

    let new_rollover = ce.entitlement.rollover.as_ref().and_then(|config| {
        let unused = ce.base_balance(None).max(Decimal::ZERO);
        build_rollover(config, unused, reset_at)
    });

    if let (Some(config), Some(new_row)) = (&ce.entitlement.rollover, &new_rollover) {
        if let Some(cap) = config.max {
            clear_excess(&mut rollovers, new_row.amount, cap);
        }
    }

    // Entity buckets reset in place; rollover is tracked at the
    // entitlement level only
    let entities: HashMap<String, EntityBalance> = ce
        .entities
        .keys()
        .map(|id| {
            (
                id.clone(),
                EntityBalance {
                    balance: reset_balance,
                    adjustment: Decimal::ZERO,
                },
            )
        })
        .collect();

    let next_reset_at = ce
        .entitlement
        .interval
        .map(|interval| add_interval(reset_at, interval, anchor_ms));

    ResetOutcome {
        balance: reset_balance,
        entities,
        rollovers,
        new_rollover,
        next_reset_at,
    }
}

/// Drop rollovers that have expired at `now`
pub fn surviving_rollovers(rollovers: &[Rollover], now_ms: i64) -> Vec<Rollover> {
    rollovers
        .iter()
        .filter(|r| r.expires_at.map(|e| e > now_ms).unwrap_or(true))
        .cloned()
        .collect()
}

/// Rollover row for `unused` allowance, clamped to the cap, stamped with an
/// expiry `length` intervals after the reset. `None` when nothing rolls.
fn build_rollover(config: &RolloverConfig, unused: Decimal, reset_at: i64) -> Option<Rollover> {
    if unused <= Decimal::ZERO {
        return None;
    }
    let amount = match config.max {
        Some(cap) => unused.min(cap),
        None => unused,
    };
    if amount <= Decimal::ZERO {
        return None;
    }
    let expires_at = config
        .length
        .map(|length| add_interval(reset_at, length, None));
    Some(Rollover {
        id: Uuid::new_v4(),
        amount,
        expires_at,
    })
}

/// Shrink prior rollovers oldest-first until the total including the
/// incoming amount fits under the cap. Oldest means soonest-expiring;
/// never-expiring rows are treated as newest.
fn clear_excess(rollovers: &mut Vec<Rollover>, incoming: Decimal, cap: Decimal) {
    let total = |rows: &[Rollover]| rows.iter().map(|r| r.amount).sum::<Decimal>();
    let mut excess = (total(rollovers) + incoming - cap).max(Decimal::ZERO);
    if excess.is_zero() {
        return;
    }

    rollovers.sort_by_key(|r| r.expires_at.unwrap_or(i64::MAX));
    for row in rollovers.iter_mut() {
        if excess.is_zero() {
            break;
        }
        let cut = row.amount.min(excess);
        row.amount -= cut;
        excess -= cut;
    }
    rollovers.retain(|r| r.amount > Decimal::ZERO);
}

#[cfg(test)]
mod tests {
    use super::*;
    use autumn_shared::{Allowance, Entitlement, IntervalConfig, ResetInterval};
    use rust_decimal_macros::dec;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn rollover_ent(
        balance: Decimal,
        config: Option<RolloverConfig>,
    ) -> CustomerEntitlement {
        CustomerEntitlement {
            id: Uuid::new_v4(),
            customer_id: "cus_1".to_string(),
            customer_product_id: None,
            entitlement: Entitlement {
                id: Uuid::new_v4(),
                feature_id: "messages".to_string(),
                allowance: Allowance::Fixed(dec!(100)),
                interval: Some(IntervalConfig::new(ResetInterval::Month, 1)),
                entity_feature_id: None,
                carry_from_previous: false,
                usage_limit: None,
                rollover: config,
            },
            balance,
            additional_balance: Decimal::ZERO,
            adjustment: dec!(5),
            entities: HashMap::new(),
            usage_allowed: false,
            unlimited: false,
            next_reset_at: Some(0),
            rollovers: vec![],
            replaceables: vec![],
            archived: false,
            version: 1,
        }
    }

    fn row(amount: Decimal, expires_at: Option<i64>) -> Rollover {
        Rollover {
            id: Uuid::new_v4(),
            amount,
            expires_at,
        }
    }

    #[test]
    fn test_unused_balance_rolls_over_with_expiry() {
        let config = RolloverConfig {
            max: None,
            length: Some(IntervalConfig::new(ResetInterval::Month, 2)),
        };
        let ce = rollover_ent(dec!(30), Some(config));

        let outcome = cycle_reset(&ce, dec!(100), 0, None);

        assert_eq!(outcome.balance, dec!(100));
        let new_row = outcome.new_rollover.unwrap();
        assert_eq!(new_row.amount, dec!(30));
        assert!(new_row.expires_at.unwrap() > 0);
    }

    #[test]
    fn test_no_config_means_no_rollover() {
        let ce = rollover_ent(dec!(30), None);
        let outcome = cycle_reset(&ce, dec!(100), 0, None);
        assert!(outcome.new_rollover.is_none());
        assert_eq!(outcome.balance, dec!(100));
    }

    #[test]
    fn test_overage_balance_does_not_roll() {
        let config = RolloverConfig {
            max: None,
            length: None,
        };
        let ce = rollover_ent(dec!(-20), Some(config));
        let outcome = cycle_reset(&ce, dec!(100), 0, None);
        assert!(outcome.new_rollover.is_none());
        // Overage does not carry into the new period either
        assert_eq!(outcome.balance, dec!(100));
    }

    #[test]
    fn test_cap_clears_oldest_first() {
        let config = RolloverConfig {
            max: Some(dec!(50)),
            length: None,
        };
        let mut ce = rollover_ent(dec!(40), Some(config));
        ce.rollovers = vec![row(dec!(20), Some(2_000)), row(dec!(25), Some(1_000))];

        let outcome = cycle_reset(&ce, dec!(100), 0, None);

        // New row is 40; prior total 45 must shrink to 10, clearing the
        // soonest-expiring (oldest) row entirely and trimming the next
        let new_row = outcome.new_rollover.unwrap();
        assert_eq!(new_row.amount, dec!(40));
        let prior: Decimal = outcome.rollovers.iter().map(|r| r.amount).sum();
        assert_eq!(prior, dec!(10));
        assert_eq!(outcome.rollovers.len(), 1);
        assert_eq!(outcome.rollovers[0].expires_at, Some(2_000));
        assert_eq!(outcome.rollovers[0].amount, dec!(10));
    }

    #[test]
    fn test_new_row_clamped_to_cap() {
        let config = RolloverConfig {
            max: Some(dec!(25)),
            length: None,
        };
        let ce = rollover_ent(dec!(80), Some(config));
        let outcome = cycle_reset(&ce, dec!(100), 0, None);
        assert_eq!(outcome.new_rollover.unwrap().amount, dec!(25));
    }

    #[test]
    fn test_expired_rollovers_dropped_at_reset() {
        let config = RolloverConfig {
            max: None,
            length: None,
        };
        let mut ce = rollover_ent(Decimal::ZERO, Some(config));
        ce.rollovers = vec![row(dec!(10), Some(500)), row(dec!(10), None)];

        let outcome = cycle_reset(&ce, dec!(100), 1_000, None);

        assert_eq!(outcome.rollovers.len(), 1);
        assert_eq!(outcome.rollovers[0].expires_at, None);
    }

    #[test]
    fn test_next_reset_advances_from_scheduled_time() {
        let ce = rollover_ent(Decimal::ZERO, None);
        let reset_at = 30 * DAY_MS;
        let outcome = cycle_reset(&ce, dec!(100), reset_at, None);
        let next = outcome.next_reset_at.unwrap();
        assert!(next > reset_at);
        // A month later, not a month from "now"
        assert!(next - reset_at >= 28 * DAY_MS && next - reset_at <= 31 * DAY_MS);
    }

    #[test]
    fn test_entity_buckets_reset_in_place() {
        let mut ce = rollover_ent(Decimal::ZERO, None);
        ce.entitlement.entity_feature_id = Some("seats".to_string());
        ce.entities.insert(
            "seat_1".to_string(),
            EntityBalance {
                balance: dec!(2),
                adjustment: dec!(-3),
            },
        );

        let outcome = cycle_reset(&ce, dec!(50), 0, None);

        let bucket = &outcome.entities["seat_1"];
        assert_eq!(bucket.balance, dec!(50));
        assert_eq!(bucket.adjustment, Decimal::ZERO);
    }
}
