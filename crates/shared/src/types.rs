//! Core billing domain types used across Autumn
//!
//! All monetary amounts and usage quantities are `rust_decimal::Decimal` so
//! proration chains never accumulate binary floating-point drift. All
//! timestamps are epoch milliseconds (`i64`), matching the payment provider's
//! billing-cycle anchors.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Features
// =============================================================================

/// What kind of capability a feature is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    /// On/off capability, no balance tracking
    Boolean,
    /// Consumable metered usage (messages, tokens, ...)
    Metered,
    /// Allocated continuous-use units (seats, workspaces, ...)
    Allocated,
    /// Credit pool that other metered features draw from
    CreditSystem,
}

/// Cost of one unit of a metered feature when drawn from a credit system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditCost {
    pub metered_feature_id: String,
    pub credit_cost: Decimal,
}

/// A billable / trackable capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    pub name: String,
    pub feature_type: FeatureType,
    /// For credit systems only: which metered features draw from this pool
    pub credit_schema: Vec<CreditCost>,
}

impl Feature {
    pub fn is_credit_system(&self) -> bool {
        self.feature_type == FeatureType::CreditSystem
    }

    /// Credit cost per unit of `feature_id` when billed against this credit
    /// system. `None` when this feature does not cover it.
    pub fn credit_cost_for(&self, feature_id: &str) -> Option<Decimal> {
        self.credit_schema
            .iter()
            .find(|c| c.metered_feature_id == feature_id)
            .map(|c| c.credit_cost)
    }
}

/// The feature itself plus every credit system whose schema covers it, in
/// catalog order. Deductions fan out across all of these.
pub fn relevant_features<'a>(features: &'a [Feature], feature_id: &str) -> Vec<&'a Feature> {
    let mut relevant: Vec<&Feature> = Vec::new();
    if let Some(f) = features.iter().find(|f| f.id == feature_id) {
        relevant.push(f);
    }
    for f in features {
        if f.is_credit_system() && f.credit_cost_for(feature_id).is_some() {
            relevant.push(f);
        }
    }
    relevant
}

// =============================================================================
// Entitlement templates
// =============================================================================

/// How much of a feature an entitlement grants
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allowance {
    Fixed(Decimal),
    Unlimited,
    /// Boolean features carry no allowance
    None,
}

impl Allowance {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Allowance::Unlimited)
    }

    /// Fixed amount, zero for unlimited / none
    pub fn fixed(&self) -> Decimal {
        match self {
            Allowance::Fixed(v) => *v,
            _ => Decimal::ZERO,
        }
    }
}

/// Reset / billing cadence unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetInterval {
    Day,
    Week,
    Month,
    Quarter,
    SemiAnnual,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalConfig {
    pub interval: ResetInterval,
    pub count: u32,
}

impl IntervalConfig {
    pub fn new(interval: ResetInterval, count: u32) -> Self {
        Self { interval, count }
    }
}

/// Rollover behaviour for unused allowance at reset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverConfig {
    /// Cap on total rollover held at any time; excess cleared oldest-first
    pub max: Option<Decimal>,
    /// How long a rolled-over amount lives; `None` = never expires
    pub length: Option<IntervalConfig>,
}

/// Template attached to a product: grants a feature an allowance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Uuid,
    pub feature_id: String,
    pub allowance: Allowance,
    /// Reset cadence; `None` = lifetime (never resets)
    pub interval: Option<IntervalConfig>,
    /// When set, the entitlement fans out per sub-entity of this feature
    pub entity_feature_id: Option<String>,
    /// Carry existing usage forward when the customer switches products
    pub carry_from_previous: bool,
    /// Hard cap on total usage (allowance + paid overage)
    pub usage_limit: Option<Decimal>,
    pub rollover: Option<RolloverConfig>,
}

impl Entitlement {
    /// Maximum overage permitted beyond the allowance, from `usage_limit`
    pub fn max_overage(&self) -> Option<Decimal> {
        self.usage_limit.map(|limit| limit - self.allowance.fixed())
    }

    /// Template invariants: boolean features carry no allowance; unlimited
    /// and lifetime entitlements never have a reset interval.
    pub fn validate(&self, feature: &Feature) -> Result<(), String> {
        if feature.feature_type == FeatureType::Boolean
            && !matches!(self.allowance, Allowance::None)
        {
            return Err(format!(
                "boolean feature {} cannot carry an allowance",
                feature.id
            ));
        }
        if self.allowance.is_unlimited() && self.interval.is_some() {
            return Err(format!(
                "unlimited entitlement for {} cannot have a reset interval",
                feature.id
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Live customer entitlements
// =============================================================================

/// Per-sub-entity balance bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EntityBalance {
    pub balance: Decimal,
    /// Running correction term, reset to zero at each interval reset
    pub adjustment: Decimal,
}

/// Unused allowance carried from a prior reset period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollover {
    pub id: Uuid,
    pub amount: Decimal,
    /// Epoch ms; `None` = never expires
    pub expires_at: Option<i64>,
}

/// A granted-but-unused allocation (e.g. a freed seat) that can be reclaimed
/// and re-granted within the billing cycle without new billing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replaceable {
    pub id: Uuid,
    pub from_entity_id: Option<String>,
    /// Deferred deletion: released on the next invoice-created event
    pub delete_next_cycle: bool,
}

/// Live, mutable instance of an entitlement for one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerEntitlement {
    pub id: Uuid,
    pub customer_id: String,
    /// `None` for loose entitlements granted directly to the customer
    pub customer_product_id: Option<Uuid>,
    pub entitlement: Entitlement,
    /// Signed: negative means overage
    pub balance: Decimal,
    /// Manually added credit, separate bucket
    pub additional_balance: Decimal,
    /// Running correction term, reset to zero at each interval reset
    pub adjustment: Decimal,
    /// Per-sub-entity balances when `entitlement.entity_feature_id` is set
    pub entities: HashMap<String, EntityBalance>,
    pub usage_allowed: bool,
    pub unlimited: bool,
    /// Epoch ms; `None` = never resets
    pub next_reset_at: Option<i64>,
    pub rollovers: Vec<Rollover>,
    pub replaceables: Vec<Replaceable>,
    pub archived: bool,
    /// Optimistic-concurrency version for conditional updates
    pub version: i64,
}

impl CustomerEntitlement {
    pub fn feature_id(&self) -> &str {
        &self.entitlement.feature_id
    }

    pub fn is_entity_scoped(&self) -> bool {
        self.entitlement.entity_feature_id.is_some()
    }

    /// Summed (balance, adjustment) across all entity buckets
    pub fn summed_entity_balance(&self) -> (Decimal, Decimal) {
        self.entities.values().fold(
            (Decimal::ZERO, Decimal::ZERO),
            |(b, a), e| (b + e.balance, a + e.adjustment),
        )
    }

    /// Base balance visible for deduction, excluding rollovers and
    /// additional credit. For entity-scoped entitlements this is the
    /// requested entity's bucket, or the sum of all buckets.
    pub fn base_balance(&self, entity_id: Option<&str>) -> Decimal {
        if self.is_entity_scoped() {
            match entity_id {
                Some(id) => self
                    .entities
                    .get(id)
                    .map(|e| e.balance)
                    .unwrap_or(Decimal::ZERO),
                None => self.summed_entity_balance().0,
            }
        } else {
            self.balance
        }
    }

    pub fn rollover_total(&self) -> Decimal {
        self.rollovers.iter().map(|r| r.amount).sum()
    }

    /// Effective balance: base + rollovers + additional credit.
    /// Meaningless for unlimited entitlements; callers must check first.
    pub fn effective_balance(&self, entity_id: Option<&str>) -> Decimal {
        self.base_balance(entity_id) + self.rollover_total() + self.additional_balance
    }

    /// Rollovers ordered soonest-expiring first; never-expiring last
    pub fn sorted_rollovers(&self) -> Vec<&Rollover> {
        let mut sorted: Vec<&Rollover> = self.rollovers.iter().collect();
        sorted.sort_by_key(|r| r.expires_at.unwrap_or(i64::MAX));
        sorted
    }

    /// Lowest balance this entitlement may reach: zero when overage is not
    /// allowed, `-max_overage` when a usage limit bounds it, unbounded
    /// otherwise.
    pub fn min_balance(&self) -> Option<Decimal> {
        if !self.usage_allowed {
            return Some(Decimal::ZERO);
        }
        self.entitlement.max_overage().map(|max| -max)
    }
}

// =============================================================================
// Products and prices
// =============================================================================

/// Lifecycle status of a customer's attached product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CusProductStatus {
    Active,
    Trialing,
    PastDue,
    Scheduled,
    Expired,
    Unknown,
}

impl CusProductStatus {
    /// Statuses that grant entitlements right now
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CusProductStatus::Active | CusProductStatus::Trialing | CusProductStatus::PastDue
        )
    }
}

impl std::fmt::Display for CusProductStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CusProductStatus::Active => write!(f, "active"),
            CusProductStatus::Trialing => write!(f, "trialing"),
            CusProductStatus::PastDue => write!(f, "past_due"),
            CusProductStatus::Scheduled => write!(f, "scheduled"),
            CusProductStatus::Expired => write!(f, "expired"),
            CusProductStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Billing cadence of a price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingIntervalKind {
    OneOff,
    Week,
    Month,
    Quarter,
    SemiAnnual,
    Year,
}

impl BillingIntervalKind {
    pub fn is_one_off(&self) -> bool {
        matches!(self, BillingIntervalKind::OneOff)
    }

    /// Reset-interval equivalent for recurring cadences
    pub fn reset_interval(&self) -> Option<ResetInterval> {
        match self {
            BillingIntervalKind::OneOff => None,
            BillingIntervalKind::Week => Some(ResetInterval::Week),
            BillingIntervalKind::Month => Some(ResetInterval::Month),
            BillingIntervalKind::Quarter => Some(ResetInterval::Quarter),
            BillingIntervalKind::SemiAnnual => Some(ResetInterval::SemiAnnual),
            BillingIntervalKind::Year => Some(ResetInterval::Year),
        }
    }

    /// Approximate length in days, used only for ordering intervals
    pub fn approx_days(&self) -> u32 {
        match self {
            BillingIntervalKind::OneOff => 0,
            BillingIntervalKind::Week => 7,
            BillingIntervalKind::Month => 30,
            BillingIntervalKind::Quarter => 90,
            BillingIntervalKind::SemiAnnual => 180,
            BillingIntervalKind::Year => 365,
        }
    }
}

/// Upper bound of a usage pricing tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierBound {
    Finite(Decimal),
    Infinite,
}

/// One ascending usage pricing tier: units up to `to` cost `amount` per
/// `billing_units`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageTier {
    pub to: TierBound,
    pub amount: Decimal,
}

/// Proration policy when a prepaid quantity increases mid-cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnIncrease {
    #[default]
    ProrateImmediately,
    /// Prorate, but bill on the next invoice
    ProrateNextCycle,
    NoProration,
}

/// Proration policy when a prepaid quantity decreases mid-cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnDecrease {
    #[default]
    ProrateImmediately,
    ProrateNextCycle,
    NoProration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProrationConfig {
    pub on_increase: OnIncrease,
    pub on_decrease: OnDecrease,
}

/// When a usage price is billed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillWhen {
    /// Prepaid: quantity purchased up front
    InAdvance,
    StartOfPeriod,
    EndOfPeriod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedPriceConfig {
    pub amount: Decimal,
    pub interval: BillingIntervalKind,
    pub interval_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePriceConfig {
    pub feature_id: String,
    /// Ascending tiers; the last tier's bound may be infinite
    pub usage_tiers: Vec<UsageTier>,
    /// Usage is rounded up to the nearest multiple before tiering
    pub billing_units: u32,
    pub bill_when: BillWhen,
    /// For end-of-period billing: prorate continuous-use changes
    pub should_prorate: bool,
    pub interval: BillingIntervalKind,
    pub interval_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceConfig {
    Fixed(FixedPriceConfig),
    Usage(UsagePriceConfig),
}

impl PriceConfig {
    pub fn interval(&self) -> IntervalOrOneOff {
        match self {
            PriceConfig::Fixed(c) => IntervalOrOneOff {
                interval: c.interval,
                count: c.interval_count,
            },
            PriceConfig::Usage(c) => IntervalOrOneOff {
                interval: c.interval,
                count: c.interval_count,
            },
        }
    }
}

/// Billing cadence of a price, possibly one-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalOrOneOff {
    pub interval: BillingIntervalKind,
    pub count: u32,
}

/// Derived classification of a price, driving plan construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingKind {
    OneOff,
    FixedCycle,
    /// Prepaid usage purchased in advance
    UsageInAdvance,
    /// Metered usage billed at end of period
    UsageInArrear,
    /// Continuous-use units prorated within the period
    InArrearProrated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: Uuid,
    /// Entitlement this price bills against, for usage prices
    pub entitlement_id: Option<Uuid>,
    pub config: PriceConfig,
    pub proration: ProrationConfig,
    /// Provider-side price reference, once created
    pub provider_price_id: Option<String>,
}

impl Price {
    pub fn billing_kind(&self) -> BillingKind {
        match &self.config {
            PriceConfig::Fixed(c) => {
                if c.interval.is_one_off() {
                    BillingKind::OneOff
                } else {
                    BillingKind::FixedCycle
                }
            }
            PriceConfig::Usage(c) => match c.bill_when {
                BillWhen::InAdvance | BillWhen::StartOfPeriod => BillingKind::UsageInAdvance,
                BillWhen::EndOfPeriod => {
                    if c.should_prorate {
                        BillingKind::InArrearProrated
                    } else {
                        BillingKind::UsageInArrear
                    }
                }
            },
        }
    }

    pub fn is_one_off(&self) -> bool {
        self.config.interval().interval.is_one_off()
    }
}

/// Free trial configuration on a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeTrial {
    pub duration_days: u32,
    /// Only one trial per customer fingerprint
    pub unique_fingerprint: bool,
    pub card_required: bool,
}

/// A purchasable product: a set of prices and entitlement templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Products in the same group replace each other on attach
    pub group: Option<String>,
    pub is_add_on: bool,
    /// Fallback product re-activated when a paid product in the group ends
    pub is_default: bool,
    pub prices: Vec<Price>,
    pub entitlements: Vec<Entitlement>,
    pub free_trial: Option<FreeTrial>,
}

impl Product {
    pub fn is_free(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn only_one_off(&self) -> bool {
        !self.prices.is_empty() && self.prices.iter().all(|p| p.is_one_off())
    }

    pub fn contains_recurring(&self) -> bool {
        self.prices.iter().any(|p| !p.is_one_off())
    }

    pub fn entitlement_for(&self, feature_id: &str) -> Option<&Entitlement> {
        self.entitlements.iter().find(|e| e.feature_id == feature_id)
    }

    pub fn price_for_entitlement(&self, entitlement_id: Uuid) -> Option<&Price> {
        self.prices
            .iter()
            .find(|p| p.entitlement_id == Some(entitlement_id))
    }
}

/// Requested quantity for a prepaid feature when attaching a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureOptions {
    pub feature_id: String,
    pub quantity: Decimal,
}

pub fn get_feature_options<'a>(
    options: &'a [FeatureOptions],
    feature_id: &str,
) -> Option<&'a FeatureOptions> {
    options.iter().find(|o| o.feature_id == feature_id)
}

/// Initial balance for a freshly inserted customer entitlement:
/// `allowance x product quantity`, plus purchased prepaid units when the
/// related price bills in advance.
pub fn starting_balance(
    entitlement: &Entitlement,
    options: Option<&FeatureOptions>,
    related_price: Option<&Price>,
    product_quantity: u32,
) -> Decimal {
    let base = entitlement.allowance.fixed() * Decimal::from(product_quantity.max(1));

    let Some(price) = related_price else {
        return base;
    };
    if price.billing_kind() != BillingKind::UsageInAdvance {
        return entitlement.allowance.fixed();
    }

    let PriceConfig::Usage(config) = &price.config else {
        return entitlement.allowance.fixed();
    };
    match options {
        Some(opts) => {
            entitlement.allowance.fixed() + opts.quantity * Decimal::from(config.billing_units)
        }
        None => entitlement.allowance.fixed(),
    }
}

// =============================================================================
// Customer aggregate
// =============================================================================

/// One instance of a product attached to a customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProduct {
    pub id: Uuid,
    pub customer_id: String,
    pub product: Product,
    /// Scope to one sub-entity, e.g. a per-seat attach
    pub entity_id: Option<String>,
    pub status: CusProductStatus,
    pub starts_at: i64,
    pub trial_ends_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
    /// Provider-side subscriptions backing this product
    pub subscription_ids: Vec<String>,
    /// Provider-side subscription schedules queued for this product
    pub schedule_ids: Vec<String>,
    pub quantity: u32,
    pub options: Vec<FeatureOptions>,
}

impl CustomerProduct {
    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }

    pub fn group(&self) -> Option<&str> {
        self.product.group.as_deref()
    }

    pub fn is_trialing(&self, now: i64) -> bool {
        self.trial_ends_at.map(|t| t > now).unwrap_or(false)
    }

    /// Flagged for cancellation at period end but not yet ended
    pub fn cancel_scheduled(&self) -> bool {
        self.canceled_at.is_some() && self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    /// Device/user fingerprint for unique-fingerprint trial enforcement
    pub fingerprint: Option<String>,
    pub provider_customer_id: Option<String>,
}

/// The full customer aggregate the deduction engine operates on: attached
/// products plus live entitlement balances keyed by id. Entitlements are
/// updated by id through [`FullCustomer::update_entitlement`], never by
/// walking and patching nested collections in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullCustomer {
    pub customer: Customer,
    pub customer_products: Vec<CustomerProduct>,
    pub entitlements: HashMap<Uuid, CustomerEntitlement>,
}

impl FullCustomer {
    pub fn live_products(&self) -> impl Iterator<Item = &CustomerProduct> {
        self.customer_products.iter().filter(|cp| cp.is_live())
    }

    /// The single live (active/trialing/past-due) main product of a group,
    /// scoped to an entity when given
    pub fn main_product_for_group(
        &self,
        group: Option<&str>,
        entity_id: Option<&str>,
    ) -> Option<&CustomerProduct> {
        self.live_products().find(|cp| {
            !cp.product.is_add_on
                && cp.group() == group
                && cp.entity_id.as_deref() == entity_id
        })
    }

    pub fn scheduled_product_for_group(
        &self,
        group: Option<&str>,
        entity_id: Option<&str>,
    ) -> Option<&CustomerProduct> {
        self.customer_products.iter().find(|cp| {
            cp.status == CusProductStatus::Scheduled
                && !cp.product.is_add_on
                && cp.group() == group
                && cp.entity_id.as_deref() == entity_id
        })
    }

    pub fn product(&self, id: Uuid) -> Option<&CustomerProduct> {
        self.customer_products.iter().find(|cp| cp.id == id)
    }

    /// Non-archived entitlements for the given features, owned by a live
    /// product or loose (not tied to any product)
    pub fn entitlements_for_features(&self, feature_ids: &[&str]) -> Vec<&CustomerEntitlement> {
        self.entitlements
            .values()
            .filter(|ce| !ce.archived && feature_ids.contains(&ce.feature_id()))
            .filter(|ce| match ce.customer_product_id {
                Some(cp_id) => self.product(cp_id).map(|cp| cp.is_live()).unwrap_or(false),
                None => true,
            })
            .collect()
    }

    /// Update one entitlement by id, returning whether it existed
    pub fn update_entitlement(
        &mut self,
        id: Uuid,
        update: impl FnOnce(&mut CustomerEntitlement),
    ) -> bool {
        match self.entitlements.get_mut(&id) {
            Some(ce) => {
                update(ce);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn metered_feature(id: &str) -> Feature {
        Feature {
            id: id.to_string(),
            name: id.to_string(),
            feature_type: FeatureType::Metered,
            credit_schema: vec![],
        }
    }

    #[test]
    fn test_relevant_features_includes_credit_systems() {
        let features = vec![
            metered_feature("messages"),
            Feature {
                id: "credits".to_string(),
                name: "Credits".to_string(),
                feature_type: FeatureType::CreditSystem,
                credit_schema: vec![CreditCost {
                    metered_feature_id: "messages".to_string(),
                    credit_cost: dec!(2),
                }],
            },
        ];

        let relevant = relevant_features(&features, "messages");
        assert_eq!(relevant.len(), 2);
        assert_eq!(relevant[0].id, "messages");
        assert_eq!(relevant[1].id, "credits");
    }

    #[test]
    fn test_entitlement_validate_boolean_allowance() {
        let feature = Feature {
            id: "sso".to_string(),
            name: "SSO".to_string(),
            feature_type: FeatureType::Boolean,
            credit_schema: vec![],
        };
        let ent = Entitlement {
            id: Uuid::new_v4(),
            feature_id: "sso".to_string(),
            allowance: Allowance::Fixed(dec!(5)),
            interval: None,
            entity_feature_id: None,
            carry_from_previous: false,
            usage_limit: None,
            rollover: None,
        };
        assert!(ent.validate(&feature).is_err());
    }

    #[test]
    fn test_entitlement_validate_unlimited_with_interval() {
        let feature = metered_feature("messages");
        let ent = Entitlement {
            id: Uuid::new_v4(),
            feature_id: "messages".to_string(),
            allowance: Allowance::Unlimited,
            interval: Some(IntervalConfig::new(ResetInterval::Month, 1)),
            entity_feature_id: None,
            carry_from_previous: false,
            usage_limit: None,
            rollover: None,
        };
        assert!(ent.validate(&feature).is_err());
    }

    #[test]
    fn test_max_overage() {
        let ent = Entitlement {
            id: Uuid::new_v4(),
            feature_id: "messages".to_string(),
            allowance: Allowance::Fixed(dec!(100)),
            interval: None,
            entity_feature_id: None,
            carry_from_previous: false,
            usage_limit: Some(dec!(250)),
            rollover: None,
        };
        assert_eq!(ent.max_overage(), Some(dec!(150)));
    }

    #[test]
    fn test_sorted_rollovers_soonest_expiry_first() {
        let ce = CustomerEntitlement {
            id: Uuid::new_v4(),
            customer_id: "cus_1".to_string(),
            customer_product_id: None,
            entitlement: Entitlement {
                id: Uuid::new_v4(),
                feature_id: "messages".to_string(),
                allowance: Allowance::Fixed(dec!(100)),
                interval: None,
                entity_feature_id: None,
                carry_from_previous: false,
                usage_limit: None,
                rollover: None,
            },
            balance: dec!(100),
            additional_balance: Decimal::ZERO,
            adjustment: Decimal::ZERO,
            entities: HashMap::new(),
            usage_allowed: false,
            unlimited: false,
            next_reset_at: None,
            rollovers: vec![
                Rollover {
                    id: Uuid::new_v4(),
                    amount: dec!(10),
                    expires_at: None,
                },
                Rollover {
                    id: Uuid::new_v4(),
                    amount: dec!(20),
                    expires_at: Some(1_000),
                },
                Rollover {
                    id: Uuid::new_v4(),
                    amount: dec!(30),
                    expires_at: Some(500),
                },
            ],
            replaceables: vec![],
            archived: false,
            version: 1,
        };

        let sorted = ce.sorted_rollovers();
        assert_eq!(sorted[0].amount, dec!(30));
        assert_eq!(sorted[1].amount, dec!(20));
        assert_eq!(sorted[2].amount, dec!(10));
        assert_eq!(ce.effective_balance(None), dec!(160));
    }

    #[test]
    fn test_starting_balance_prepaid() {
        let ent_id = Uuid::new_v4();
        let ent = Entitlement {
            id: ent_id,
            feature_id: "seats".to_string(),
            allowance: Allowance::Fixed(dec!(5)),
            interval: None,
            entity_feature_id: None,
            carry_from_previous: false,
            usage_limit: None,
            rollover: None,
        };
        let price = Price {
            id: Uuid::new_v4(),
            entitlement_id: Some(ent_id),
            config: PriceConfig::Usage(UsagePriceConfig {
                feature_id: "seats".to_string(),
                usage_tiers: vec![UsageTier {
                    to: TierBound::Infinite,
                    amount: dec!(10),
                }],
                billing_units: 1,
                bill_when: BillWhen::InAdvance,
                should_prorate: false,
                interval: BillingIntervalKind::Month,
                interval_count: 1,
            }),
            proration: ProrationConfig::default(),
            provider_price_id: None,
        };
        let options = FeatureOptions {
            feature_id: "seats".to_string(),
            quantity: dec!(3),
        };

        // 5 included + 3 purchased units
        assert_eq!(
            starting_balance(&ent, Some(&options), Some(&price), 1),
            dec!(8)
        );
        // No related price: allowance x product quantity
        assert_eq!(starting_balance(&ent, None, None, 2), dec!(10));
    }
}
