//! Balance deduction engine
//!
//! Given a feature, the customer's eligible entitlements, and either an
//! amount to deduct or a target absolute balance, computes per-entitlement
//! updates. Pure over the in-memory [`FullCustomer`] aggregate: callers apply
//! the resulting updates under the per-customer lock (see [`crate::cache`]),
//! so the read-modify-write is a single atomic step.
//!
//! Selection order:
//! 1. Entitlements scoped to the requested sub-entity before unscoped ones
//! 2. Entitlements that disallow overage drain first
//! 3. Ascending non-rollover balance
//!
//! Within one entitlement: rollover credit (soonest-expiring first), then
//! base balance, then additional balance, then (if allowed) overage.

use std::collections::HashMap;

use autumn_shared::{
    relevant_features, CustomerEntitlement, EntityBalance, Feature, FullCustomer, Replaceable,
    Rollover,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::money::{div_rounded, INTERNAL_SCALE};

/// What to do when a deduction cannot be satisfied without overage on an
/// entitlement that disallows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverageBehaviour {
    /// Clamp the deduction so no disallowing entitlement goes negative
    #[default]
    Cap,
    /// Fail with an insufficient-balance error, applying nothing
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeductionMode {
    /// Deduct (positive) or credit (negative) this many feature units
    Amount(Decimal),
    /// Drive the group's effective balance to this value
    TargetBalance(Decimal),
}

#[derive(Debug, Clone)]
pub struct DeductionRequest {
    pub feature_id: String,
    pub mode: DeductionMode,
    pub entity_id: Option<String>,
    pub overage_behaviour: OverageBehaviour,
    /// Mirror the balance change into the adjustment term so interval
    /// resets preserve manual balance edits
    pub add_to_adjustment: bool,
    /// Leave manually granted additional balance untouched
    pub skip_additional_balance: bool,
    /// Org-level config: flip the entitlement drain order
    pub reverse_order: bool,
    /// Track replaceable grants (paid allocated features only): consumed
    /// units eat existing grants, freed units emit new ones
    pub track_replaceables: bool,
}

impl DeductionRequest {
    pub fn track(feature_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            feature_id: feature_id.into(),
            mode: DeductionMode::Amount(amount),
            entity_id: None,
            overage_behaviour: OverageBehaviour::Cap,
            add_to_adjustment: false,
            skip_additional_balance: true,
            reverse_order: false,
            track_replaceables: false,
        }
    }

    pub fn set_balance(feature_id: impl Into<String>, target: Decimal) -> Self {
        Self {
            feature_id: feature_id.into(),
            mode: DeductionMode::TargetBalance(target),
            entity_id: None,
            overage_behaviour: OverageBehaviour::Cap,
            add_to_adjustment: true,
            skip_additional_balance: true,
            reverse_order: false,
            track_replaceables: false,
        }
    }

    pub fn tracking_replaceables(mut self) -> Self {
        self.track_replaceables = true;
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn rejecting_overage(mut self) -> Self {
        self.overage_behaviour = OverageBehaviour::Reject;
        self
    }
}

/// New state for one entitlement after a deduction; applied wholesale under
/// the customer lock with a version check
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EntitlementUpdate {
    pub balance: Decimal,
    pub additional_balance: Decimal,
    pub adjustment: Decimal,
    pub entities: HashMap<String, EntityBalance>,
    pub rollovers: Vec<Rollover>,
    /// Net amount drawn from this entitlement, in its own units
    /// (credit-system entitlements deduct `credit_cost` per feature unit)
    pub deducted: Decimal,
}

impl EntitlementUpdate {
    fn from_state(ce: &CustomerEntitlement, deducted: Decimal) -> Self {
        Self {
            balance: ce.balance,
            additional_balance: ce.additional_balance,
            adjustment: ce.adjustment,
            entities: ce.entities.clone(),
            rollovers: ce.rollovers.clone(),
            deducted,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeductionOutcome {
    pub updates: HashMap<Uuid, EntitlementUpdate>,
    /// Total satisfied, in feature units
    pub total_deducted: Decimal,
    /// Requested feature units that could not be satisfied (cap mode)
    pub remaining: Decimal,
    /// Replaceable grants to create (freed paid-allocated units)
    pub new_replaceables: Vec<(Uuid, Replaceable)>,
    /// Replaceable grants consumed without new billing
    pub deleted_replaceables: Vec<Uuid>,
    /// An unlimited entitlement covers this feature; nothing was deducted
    pub unlimited: bool,
}

/// Run the deduction algorithm. Returns the updates to apply; the aggregate
/// itself is not mutated.
pub fn deduct(
    full_cus: &FullCustomer,
    features: &[Feature],
    request: &DeductionRequest,
) -> BillingResult<DeductionOutcome> {
    let relevant = match request.mode {
        // Explicit balance-set operations target the feature itself only
        DeductionMode::TargetBalance(_) => features
            .iter()
            .filter(|f| f.id == request.feature_id)
            .collect::<Vec<_>>(),
        DeductionMode::Amount(_) => relevant_features(features, &request.feature_id),
    };
    if relevant.is_empty() {
        return Err(BillingError::NotFound(format!(
            "feature {} not found",
            request.feature_id
        )));
    }

    let feature_ids: Vec<&str> = relevant.iter().map(|f| f.id.as_str()).collect();
    let mut eligible = full_cus.entitlements_for_features(&feature_ids);

    if eligible.iter().any(|ce| {
        ce.unlimited || ce.entitlement.allowance.is_unlimited()
    }) {
        return Ok(DeductionOutcome {
            unlimited: true,
            ..Default::default()
        });
    }

    sort_entitlements(&mut eligible, request);
    if eligible.is_empty() {
        let amount = match request.mode {
            DeductionMode::Amount(a) => a,
            DeductionMode::TargetBalance(_) => Decimal::ZERO,
        };
        return Ok(DeductionOutcome {
            remaining: amount.max(Decimal::ZERO),
            ..Default::default()
        });
    }

    let credit_costs: HashMap<&str, Decimal> = relevant
        .iter()
        .map(|f| {
            let cost = f
                .credit_cost_for(&request.feature_id)
                .unwrap_or(Decimal::ONE);
            (f.id.as_str(), cost)
        })
        .collect();

    // Working copies, mutated in place; updates are emitted from these
    let mut working: Vec<CustomerEntitlement> = eligible.iter().map(|ce| (*ce).clone()).collect();

    let amount = match request.mode {
        DeductionMode::Amount(a) => a,
        DeductionMode::TargetBalance(target) => {
            let current: Decimal = working
                .iter()
                .map(|ce| ce.effective_balance(request.entity_id.as_deref()))
                .sum();
            current - target
        }
    };

    let mut outcome = DeductionOutcome::default();

    if amount > Decimal::ZERO {
        let remaining = apply_deduction(&mut working, amount, request, &credit_costs)?;
        outcome.remaining = remaining;
        outcome.total_deducted = amount - remaining;
    } else if amount < Decimal::ZERO {
        apply_credit(&mut working, -amount, request, &credit_costs);
        outcome.total_deducted = amount;
    }

    for (original, updated) in eligible.iter().zip(working.iter()) {
        if *original == updated {
            continue;
        }
        let deducted = deducted_from(original, updated);
        adjust_replaceables(updated, deducted, request, &mut outcome);
        outcome
            .updates
            .insert(updated.id, EntitlementUpdate::from_state(updated, deducted));
    }

    Ok(outcome)
}

/// Net units drawn from an entitlement across all of its buckets
fn deducted_from(before: &CustomerEntitlement, after: &CustomerEntitlement) -> Decimal {
    let total = |ce: &CustomerEntitlement| {
        ce.base_balance(None) + ce.rollover_total() + ce.additional_balance
    };
    total(before) - total(after)
}

fn sort_entitlements(ents: &mut Vec<&CustomerEntitlement>, request: &DeductionRequest) {
    let entity_id = request.entity_id.as_deref();
    ents.sort_by(|a, b| {
        let entity_rank = |ce: &CustomerEntitlement| -> u8 {
            match (entity_id, ce.is_entity_scoped()) {
                (Some(id), true) if ce.entities.contains_key(id) => 0,
                (Some(_), true) => 2,
                (Some(_), false) => 1,
                (None, scoped) => u8::from(scoped),
            }
        };
        // Soonest-expiring rollover credit gets consumed before longer-lived
        // credit; entitlements without expiring rollovers sort last
        let soonest_expiry = |ce: &CustomerEntitlement| -> i64 {
            ce.rollovers
                .iter()
                .filter_map(|r| r.expires_at)
                .min()
                .unwrap_or(i64::MAX)
        };
        entity_rank(a)
            .cmp(&entity_rank(b))
            .then(a.usage_allowed.cmp(&b.usage_allowed))
            .then(
                a.base_balance(entity_id)
                    .cmp(&b.base_balance(entity_id)),
            )
            .then(soonest_expiry(a).cmp(&soonest_expiry(b)))
            .then(a.id.cmp(&b.id))
    });
    if request.reverse_order {
        ents.reverse();
    }
}

/// Deduct `amount` feature units across the sorted entitlements.
/// Returns the unsatisfied remainder (cap mode) or an error (reject mode).
fn apply_deduction(
    working: &mut [CustomerEntitlement],
    amount: Decimal,
    request: &DeductionRequest,
    credit_costs: &HashMap<&str, Decimal>,
) -> BillingResult<Decimal> {
    let entity_id = request.entity_id.as_deref();

    // Reject mode fails up front so nothing is partially applied
    if request.overage_behaviour == OverageBehaviour::Reject {
        let capacity = group_capacity(working, request, credit_costs);
        if let Some(capacity) = capacity {
            if capacity < amount {
                return Err(BillingError::InsufficientBalance {
                    feature_id: request.feature_id.clone(),
                    required: amount,
                    available: capacity,
                });
            }
        }
    }

    let mut remaining = amount;

    // Phase 1: positive stores, in selection order
    for ce in working.iter_mut() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let cost = credit_costs
            .get(ce.feature_id())
            .copied()
            .unwrap_or(Decimal::ONE);
        let drained = drain_positive(ce, remaining * cost, entity_id, request);
        remaining -= div_rounded(drained, cost, INTERNAL_SCALE);
    }

    // Phase 2: overage on entitlements that allow it
    for ce in working.iter_mut() {
        if remaining <= Decimal::ZERO {
            break;
        }
        if !ce.usage_allowed {
            continue;
        }
        let cost = credit_costs
            .get(ce.feature_id())
            .copied()
            .unwrap_or(Decimal::ONE);
        let drained = drain_overage(ce, remaining * cost, entity_id, request);
        remaining -= div_rounded(drained, cost, INTERNAL_SCALE);
    }

    Ok(remaining.max(Decimal::ZERO))
}

/// Total drainable feature units across the group; `None` when any
/// usage-allowed entitlement has no usage limit (unbounded overage)
fn group_capacity(
    working: &[CustomerEntitlement],
    request: &DeductionRequest,
    credit_costs: &HashMap<&str, Decimal>,
) -> Option<Decimal> {
    let entity_id = request.entity_id.as_deref();
    let mut total = Decimal::ZERO;
    for ce in working {
        let floor = match ce.min_balance() {
            Some(floor) => floor,
            None => return None,
        };
        let base = ce.base_balance(entity_id);
        let mut drainable = (base - floor).max(Decimal::ZERO) + ce.rollover_total();
        if !request.skip_additional_balance {
            drainable += ce.additional_balance;
        }
        let cost = credit_costs
            .get(ce.feature_id())
            .copied()
            .unwrap_or(Decimal::ONE);
        total += div_rounded(drainable, cost, INTERNAL_SCALE);
    }
    Some(total)
}

/// Drain up to `need` units from an entitlement's positive stores:
/// rollovers (soonest-expiring first), base balance down to zero, then
/// additional balance. Returns the amount drained, in entitlement units.
fn drain_positive(
    ce: &mut CustomerEntitlement,
    need: Decimal,
    entity_id: Option<&str>,
    request: &DeductionRequest,
) -> Decimal {
    let mut drained = Decimal::ZERO;

    // Rollovers, soonest expiry first
    let mut order: Vec<usize> = (0..ce.rollovers.len()).collect();
    order.sort_by_key(|&i| ce.rollovers[i].expires_at.unwrap_or(i64::MAX));
    for i in order {
        if drained >= need {
            break;
        }
        let take = ce.rollovers[i].amount.min(need - drained);
        if take > Decimal::ZERO {
            ce.rollovers[i].amount -= take;
            drained += take;
        }
    }
    ce.rollovers.retain(|r| r.amount > Decimal::ZERO);

    // Base balance, down to zero
    if drained < need {
        drained += drain_base(ce, need - drained, entity_id, Some(Decimal::ZERO), request);
    }

    // Additional (manually granted) balance
    if drained < need && !request.skip_additional_balance {
        let take = ce.additional_balance.max(Decimal::ZERO).min(need - drained);
        ce.additional_balance -= take;
        drained += take;
    }

    drained
}

/// Push the base balance below zero, down to the entitlement's floor
fn drain_overage(
    ce: &mut CustomerEntitlement,
    need: Decimal,
    entity_id: Option<&str>,
    request: &DeductionRequest,
) -> Decimal {
    let floor = ce.min_balance();
    drain_base(ce, need, entity_id, floor, request)
}

/// Lower the base balance (or the entity bucket) by up to `need`, not past
/// `floor` (`None` means unbounded). Returns the amount taken.
fn drain_base(
    ce: &mut CustomerEntitlement,
    need: Decimal,
    entity_id: Option<&str>,
    floor: Option<Decimal>,
    request: &DeductionRequest,
) -> Decimal {
    let room = |balance: Decimal, want: Decimal| match floor {
        Some(floor) => (balance - floor).max(Decimal::ZERO).min(want),
        None => want,
    };
    let mut taken = Decimal::ZERO;

    if ce.is_entity_scoped() {
        let mut keys: Vec<String> = match entity_id {
            Some(id) => {
                if ce.entities.contains_key(id) {
                    vec![id.to_string()]
                } else {
                    return Decimal::ZERO;
                }
            }
            None => {
                let mut all: Vec<String> = ce.entities.keys().cloned().collect();
                all.sort();
                all
            }
        };
        for key in keys.drain(..) {
            if taken >= need {
                break;
            }
            if let Some(bucket) = ce.entities.get_mut(&key) {
                let take = room(bucket.balance, need - taken);
                if take > Decimal::ZERO {
                    bucket.balance -= take;
                    if request.add_to_adjustment {
                        bucket.adjustment -= take;
                    }
                    taken += take;
                }
            }
        }
        return taken;
    }

    let take = room(ce.balance, need);
    if take > Decimal::ZERO {
        ce.balance -= take;
        if request.add_to_adjustment {
            ce.adjustment -= take;
        }
        taken = take;
    }
    taken
}

/// Credit `amount` feature units back, deterministically: repay overage in
/// reverse selection order first, then refill base balances in the same
/// reverse order. Determinism makes a repeated target-balance set a no-op.
fn apply_credit(
    working: &mut [CustomerEntitlement],
    amount: Decimal,
    request: &DeductionRequest,
    credit_costs: &HashMap<&str, Decimal>,
) {
    let entity_id = request.entity_id.as_deref();
    let mut remaining = amount;

    // Repay overage: most-recently-drained entitlements first
    for ce in working.iter_mut().rev() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let cost = credit_costs
            .get(ce.feature_id())
            .copied()
            .unwrap_or(Decimal::ONE);
        let credited = credit_base(ce, remaining * cost, entity_id, true, request);
        remaining -= div_rounded(credited, cost, INTERNAL_SCALE);
    }

    // Refill positive balances
    for ce in working.iter_mut().rev() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let cost = credit_costs
            .get(ce.feature_id())
            .copied()
            .unwrap_or(Decimal::ONE);
        let credited = credit_base(ce, remaining * cost, entity_id, false, request);
        remaining -= div_rounded(credited, cost, INTERNAL_SCALE);
    }

    // Remainder lands on the first entitlement, uncapped
    if remaining > Decimal::ZERO {
        if let Some(ce) = working.first_mut() {
            if ce.is_entity_scoped() {
                let key = entity_id
                    .map(|s| s.to_string())
                    .or_else(|| {
                        let mut keys: Vec<&String> = ce.entities.keys().collect();
                        keys.sort();
                        keys.first().map(|k| (*k).to_string())
                    });
                if let Some(key) = key {
                    let bucket = ce.entities.entry(key).or_default();
                    bucket.balance += remaining;
                    if request.add_to_adjustment {
                        bucket.adjustment += remaining;
                    }
                }
            } else {
                ce.balance += remaining;
                if request.add_to_adjustment {
                    ce.adjustment += remaining;
                }
            }
        }
    }
}

/// Raise the base balance by up to `need`. When `only_negative`, stop at
/// zero (overage repayment); otherwise no cap is applied here, the caller
/// bounds the total.
fn credit_base(
    ce: &mut CustomerEntitlement,
    need: Decimal,
    entity_id: Option<&str>,
    only_negative: bool,
    request: &DeductionRequest,
) -> Decimal {
    let mut credited = Decimal::ZERO;

    if ce.is_entity_scoped() {
        let mut keys: Vec<String> = match entity_id {
            Some(id) if ce.entities.contains_key(id) => vec![id.to_string()],
            Some(_) => return Decimal::ZERO,
            None => {
                let mut all: Vec<String> = ce.entities.keys().cloned().collect();
                all.sort();
                all
            }
        };
        for key in keys.drain(..) {
            if credited >= need {
                break;
            }
            if let Some(bucket) = ce.entities.get_mut(&key) {
                let room = if only_negative {
                    (-bucket.balance).max(Decimal::ZERO)
                } else {
                    need - credited
                };
                let give = room.min(need - credited);
                if give > Decimal::ZERO {
                    bucket.balance += give;
                    if request.add_to_adjustment {
                        bucket.adjustment += give;
                    }
                    credited += give;
                }
            }
        }
        return credited;
    }

    let room = if only_negative {
        (-ce.balance).max(Decimal::ZERO)
    } else {
        need
    };
    let give = room.min(need);
    if give > Decimal::ZERO {
        ce.balance += give;
        if request.add_to_adjustment {
            ce.adjustment += give;
        }
        credited = give;
    }
    credited
}

/// Replaceable-unit accounting for paid allocated features: consumed units
/// first eat existing replaceable grants (no new billing); freed units
/// become replaceable grants released on the next invoice.
fn adjust_replaceables(
    updated: &CustomerEntitlement,
    deducted: Decimal,
    request: &DeductionRequest,
    outcome: &mut DeductionOutcome,
) {
    use rust_decimal::prelude::ToPrimitive;

    if !request.track_replaceables {
        return;
    }

    let units = deducted.abs().floor().to_i64().unwrap_or(0);
    if units == 0 {
        return;
    }

    if deducted > Decimal::ZERO {
        // Units consumed: absorb with existing grants where possible
        let consume = (units as usize).min(updated.replaceables.len());
        for r in updated.replaceables.iter().take(consume) {
            outcome.deleted_replaceables.push(r.id);
        }
    } else {
        // Units freed mid-cycle: grant placeholders so re-adding the same
        // logical unit within this cycle does not double-charge
        for _ in 0..units {
            outcome.new_replaceables.push((
                updated.id,
                Replaceable {
                    id: Uuid::new_v4(),
                    from_entity_id: request.entity_id.clone(),
                    delete_next_cycle: true,
                },
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autumn_shared::{
        Allowance, CreditCost, Customer, CustomerProduct, Entitlement, FeatureType,
        IntervalConfig, ResetInterval,
    };
    use rust_decimal_macros::dec;

    fn feature(id: &str) -> Feature {
        Feature {
            id: id.to_string(),
            name: id.to_string(),
            feature_type: FeatureType::Metered,
            credit_schema: vec![],
        }
    }

    fn entitlement(feature_id: &str, allowance: Decimal) -> Entitlement {
        Entitlement {
            id: Uuid::new_v4(),
            feature_id: feature_id.to_string(),
            allowance: Allowance::Fixed(allowance),
            interval: Some(IntervalConfig::new(ResetInterval::Month, 1)),
            entity_feature_id: None,
            carry_from_previous: false,
            usage_limit: None,
            rollover: None,
        }
    }

    fn cus_ent(feature_id: &str, balance: Decimal, usage_allowed: bool) -> CustomerEntitlement {
        CustomerEntitlement {
            id: Uuid::new_v4(),
            customer_id: "cus_1".to_string(),
            customer_product_id: None,
            entitlement: entitlement(feature_id, balance.max(Decimal::ZERO)),
            balance,
            additional_balance: Decimal::ZERO,
            adjustment: Decimal::ZERO,
            entities: HashMap::new(),
            usage_allowed,
            unlimited: false,
            next_reset_at: None,
            rollovers: vec![],
            replaceables: vec![],
            archived: false,
            version: 1,
        }
    }

    fn customer_with(ents: Vec<CustomerEntitlement>) -> FullCustomer {
        FullCustomer {
            customer: Customer {
                id: "cus_1".to_string(),
                fingerprint: None,
                provider_customer_id: None,
            },
            customer_products: Vec::<CustomerProduct>::new(),
            entitlements: ents.into_iter().map(|ce| (ce.id, ce)).collect(),
        }
    }

    fn total_effective(cus: &FullCustomer, updates: &HashMap<Uuid, EntitlementUpdate>) -> Decimal {
        cus.entitlements
            .values()
            .map(|ce| match updates.get(&ce.id) {
                Some(u) => {
                    u.balance
                        + u.additional_balance
                        + u.rollovers.iter().map(|r| r.amount).sum::<Decimal>()
                }
                None => ce.effective_balance(None),
            })
            .sum()
    }

    #[test]
    fn test_overage_ordering_fixture() {
        // Non-overage ent (200) drains before an ent already in overage
        // (-100): deducting 150 leaves {50, -100}
        let a = cus_ent("messages", dec!(200), false);
        let b = cus_ent("messages", dec!(-100), true);
        let (a_id, b_id) = (a.id, b.id);
        let cus = customer_with(vec![a, b]);

        let outcome = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::track("messages", dec!(150)),
        )
        .unwrap();

        assert_eq!(outcome.updates[&a_id].balance, dec!(50));
        assert!(outcome.updates.get(&b_id).is_none());
        assert_eq!(outcome.total_deducted, dec!(150));
        assert_eq!(outcome.remaining, Decimal::ZERO);
    }

    #[test]
    fn test_expiring_rollover_consumed_first() {
        // Equal base balances: the entitlement whose rollover expires
        // soonest is drained, leaving the long-lived credit intact
        let mut soon = cus_ent("messages", dec!(0), false);
        soon.rollovers = vec![Rollover {
            id: Uuid::new_v4(),
            amount: dec!(10),
            expires_at: Some(1_000),
        }];
        let mut late = cus_ent("messages", dec!(0), false);
        late.rollovers = vec![Rollover {
            id: Uuid::new_v4(),
            amount: dec!(10),
            expires_at: Some(9_000_000),
        }];
        let (soon_id, late_id) = (soon.id, late.id);
        let cus = customer_with(vec![soon, late]);

        let outcome = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::track("messages", dec!(10)),
        )
        .unwrap();

        let update = &outcome.updates[&soon_id];
        assert_eq!(update.deducted, dec!(10));
        assert!(update.rollovers.is_empty());
        assert!(outcome.updates.get(&late_id).is_none());
    }

    #[test]
    fn test_deduction_conservation() {
        let ents = vec![
            cus_ent("messages", dec!(30), false),
            cus_ent("messages", dec!(70), false),
            cus_ent("messages", dec!(25), true),
        ];
        let cus = customer_with(ents);
        let before: Decimal = cus
            .entitlements
            .values()
            .map(|ce| ce.effective_balance(None))
            .sum();

        let outcome = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::track("messages", dec!(37.89)),
        )
        .unwrap();

        let after = total_effective(&cus, &outcome.updates);
        assert_eq!(before - outcome.total_deducted, after);
        assert_eq!(outcome.total_deducted, dec!(37.89));
    }

    #[test]
    fn test_rollover_consumed_before_base_soonest_expiry_first() {
        let mut ce = cus_ent("messages", dec!(100), false);
        ce.rollovers = vec![
            Rollover {
                id: Uuid::new_v4(),
                amount: dec!(10),
                expires_at: Some(2_000),
            },
            Rollover {
                id: Uuid::new_v4(),
                amount: dec!(10),
                expires_at: Some(1_000),
            },
        ];
        let soonest = ce.rollovers[1].id;
        let id = ce.id;
        let cus = customer_with(vec![ce]);

        let outcome = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::track("messages", dec!(15)),
        )
        .unwrap();

        let update = &outcome.updates[&id];
        // Soonest-expiring rollover fully gone, 5 taken from the later one
        assert!(update.rollovers.iter().all(|r| r.id != soonest));
        assert_eq!(update.rollovers[0].amount, dec!(5));
        assert_eq!(update.balance, dec!(100));
    }

    #[test]
    fn test_cap_clamps_without_overage() {
        let ce = cus_ent("messages", dec!(40), false);
        let id = ce.id;
        let cus = customer_with(vec![ce]);

        let outcome = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::track("messages", dec!(100)),
        )
        .unwrap();

        assert_eq!(outcome.updates[&id].balance, Decimal::ZERO);
        assert_eq!(outcome.remaining, dec!(60));
        assert_eq!(outcome.total_deducted, dec!(40));
    }

    #[test]
    fn test_reject_mode_applies_nothing() {
        let ce = cus_ent("messages", dec!(40), false);
        let cus = customer_with(vec![ce]);

        let err = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::track("messages", dec!(100)).rejecting_overage(),
        )
        .unwrap_err();

        match err {
            BillingError::InsufficientBalance {
                required, available, ..
            } => {
                assert_eq!(required, dec!(100));
                assert_eq!(available, dec!(40));
            }
            other => panic!("expected InsufficientBalance, got {other}"),
        }
    }

    #[test]
    fn test_usage_limit_bounds_overage() {
        let mut ce = cus_ent("messages", dec!(10), true);
        ce.entitlement.allowance = Allowance::Fixed(dec!(10));
        ce.entitlement.usage_limit = Some(dec!(30)); // max overage 20
        let id = ce.id;
        let cus = customer_with(vec![ce]);

        let outcome = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::track("messages", dec!(50)),
        )
        .unwrap();

        assert_eq!(outcome.updates[&id].balance, dec!(-20));
        assert_eq!(outcome.remaining, dec!(20));
    }

    #[test]
    fn test_target_balance_idempotent() {
        let ce = cus_ent("messages", dec!(100), false);
        let id = ce.id;
        let mut cus = customer_with(vec![ce]);

        let request = DeductionRequest::set_balance("messages", dec!(40));
        let first = deduct(&cus, &[feature("messages")], &request).unwrap();
        assert_eq!(first.updates[&id].balance, dec!(40));
        assert_eq!(first.total_deducted, dec!(60));

        // Apply, then set the same target again: zero net deduction
        let update = first.updates[&id].clone();
        cus.update_entitlement(id, |ce| {
            ce.balance = update.balance;
            ce.additional_balance = update.additional_balance;
            ce.adjustment = update.adjustment;
            ce.rollovers = update.rollovers.clone();
        });

        let second = deduct(&cus, &[feature("messages")], &request).unwrap();
        assert!(second.updates.is_empty());
        assert_eq!(second.total_deducted, Decimal::ZERO);
    }

    #[test]
    fn test_target_balance_credit_repays_overage_first() {
        let a = cus_ent("messages", dec!(0), false);
        let b = cus_ent("messages", dec!(-30), true);
        let (a_id, b_id) = (a.id, b.id);
        let cus = customer_with(vec![a, b]);

        // Current effective -30, target 20: credit 50
        let outcome = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::set_balance("messages", dec!(20)),
        )
        .unwrap();

        assert_eq!(outcome.updates[&b_id].balance, dec!(20));
        assert!(outcome.updates.get(&a_id).is_none());
    }

    #[test]
    fn test_credit_system_fan_out() {
        // No direct messages entitlement; one credit-system pool at cost 2
        let credit_feature = Feature {
            id: "credits".to_string(),
            name: "Credits".to_string(),
            feature_type: FeatureType::CreditSystem,
            credit_schema: vec![CreditCost {
                metered_feature_id: "messages".to_string(),
                credit_cost: dec!(2),
            }],
        };
        let pool = cus_ent("credits", dec!(100), false);
        let id = pool.id;
        let cus = customer_with(vec![pool]);

        let outcome = deduct(
            &cus,
            &[feature("messages"), credit_feature],
            &DeductionRequest::track("messages", dec!(10)),
        )
        .unwrap();

        // 10 message units at cost 2 = 20 credits
        assert_eq!(outcome.updates[&id].balance, dec!(80));
        assert_eq!(outcome.updates[&id].deducted, dec!(20));
    }

    #[test]
    fn test_unlimited_short_circuits() {
        let mut ce = cus_ent("messages", dec!(5), false);
        ce.unlimited = true;
        let cus = customer_with(vec![ce]);

        let outcome = deduct(
            &cus,
            &[feature("messages")],
            &DeductionRequest::track("messages", dec!(1_000_000)),
        )
        .unwrap();

        assert!(outcome.unlimited);
        assert!(outcome.updates.is_empty());
    }

    #[test]
    fn test_entity_scoped_deduction_targets_bucket() {
        let mut ce = cus_ent("tokens", Decimal::ZERO, false);
        ce.entitlement.entity_feature_id = Some("seats".to_string());
        ce.entities.insert(
            "seat_1".to_string(),
            EntityBalance {
                balance: dec!(50),
                adjustment: Decimal::ZERO,
            },
        );
        ce.entities.insert(
            "seat_2".to_string(),
            EntityBalance {
                balance: dec!(50),
                adjustment: Decimal::ZERO,
            },
        );
        let id = ce.id;
        let cus = customer_with(vec![ce]);

        let outcome = deduct(
            &cus,
            &[feature("tokens")],
            &DeductionRequest::track("tokens", dec!(20)).with_entity("seat_2"),
        )
        .unwrap();

        let update = &outcome.updates[&id];
        assert_eq!(update.entities["seat_1"].balance, dec!(50));
        assert_eq!(update.entities["seat_2"].balance, dec!(30));
    }

    #[test]
    fn test_deduction_deterministic() {
        // Same inputs always produce the same drain order and outcome
        let ents = vec![
            cus_ent("messages", dec!(10), true),
            cus_ent("messages", dec!(20), false),
            cus_ent("messages", dec!(5), false),
        ];
        let cus = customer_with(ents);
        let request = DeductionRequest::track("messages", dec!(12));

        let first = deduct(&cus, &[feature("messages")], &request).unwrap();
        let second = deduct(&cus, &[feature("messages")], &request).unwrap();
        assert_eq!(first.updates, second.updates);
    }

    #[test]
    fn test_replaceables_consumed_before_new_billing() {
        // Two freed seats exist as replaceable grants; adding two seats
        // back consumes them instead of creating billable usage
        let mut ce = cus_ent("seats", dec!(5), true);
        ce.replaceables = vec![
            Replaceable {
                id: Uuid::new_v4(),
                from_entity_id: None,
                delete_next_cycle: true,
            },
            Replaceable {
                id: Uuid::new_v4(),
                from_entity_id: None,
                delete_next_cycle: true,
            },
        ];
        let grant_ids: Vec<Uuid> = ce.replaceables.iter().map(|r| r.id).collect();
        let cus = customer_with(vec![ce]);

        let mut request = DeductionRequest::track("seats", dec!(2)).tracking_replaceables();
        request.overage_behaviour = OverageBehaviour::Reject;
        let outcome = deduct(&cus, &[feature("seats")], &request).unwrap();

        assert_eq!(outcome.deleted_replaceables, grant_ids);
        assert!(outcome.new_replaceables.is_empty());
    }

    #[test]
    fn test_freed_units_emit_replaceables() {
        let ce = cus_ent("seats", dec!(3), true);
        let id = ce.id;
        let cus = customer_with(vec![ce]);

        // Removing a seat frees one unit: balance 3 -> 4
        let outcome = deduct(
            &cus,
            &[feature("seats")],
            &DeductionRequest::track("seats", dec!(-1)).tracking_replaceables(),
        )
        .unwrap();

        assert_eq!(outcome.updates[&id].balance, dec!(4));
        assert_eq!(outcome.new_replaceables.len(), 1);
        assert_eq!(outcome.new_replaceables[0].0, id);
        assert!(outcome.new_replaceables[0].1.delete_next_cycle);
    }
}
