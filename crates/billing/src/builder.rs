//! Billing plan builder
//!
//! One build function per classified intent, dispatched exhaustively. Each
//! produces a [`BillingPlan`]: record changes plus provider-neutral actions,
//! with all proration and carry-forward math done here so the finalizer and
//! executor never recompute amounts.

use autumn_shared::{
    get_feature_options, starting_balance, Allowance, BillWhen, BillingKind, CusProductStatus,
    CustomerEntitlement, CustomerProduct, FeatureOptions, FreeTrial, FullCustomer, Price,
    PriceConfig, Product,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::deduction::{deduct, DeductionRequest};
use crate::error::{BillingError, BillingResult};
use crate::intent::{AttachParams, BillingIntent, CancelKind};
use crate::intervals::next_reset;
use crate::plan::{
    BillingPlan, CustomerProductUpdate, LineItem, PlanItem, ProrationFlag, ProviderAction,
    SchedulePhase,
};
use crate::proration::{amount_for_quantity, apply_proration, round_usage, BillingPeriod};
use crate::provider::ProviderSubscription;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// How charges arising from this mutation are collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BillingBehavior {
    /// Charge immediately where the plan says so
    #[default]
    Immediate,
    /// Defer all charges to the next invoice
    NextCycleOnly,
}

/// Everything a build function may read. Assembled by the service from
/// storage, cache, and provider reads; the builder itself does no I/O.
#[derive(Debug, Clone)]
pub struct BuildContext<'a> {
    pub full_cus: &'a FullCustomer,
    pub features: &'a [autumn_shared::Feature],
    /// Current provider subscription backing the affected product, if any
    pub provider_sub: Option<&'a ProviderSubscription>,
    /// Default product for the affected group, for cancel re-activation
    pub default_product: Option<&'a Product>,
    pub now_ms: i64,
    pub billing_behavior: BillingBehavior,
    /// Customer fingerprint already consumed a unique-fingerprint trial
    pub trial_consumed: bool,
}

pub fn build(ctx: &BuildContext<'_>, intent: BillingIntent) -> BillingResult<BillingPlan> {
    let customer_id = ctx.full_cus.customer.id.clone();
    match intent {
        BillingIntent::NewSubscription { params } => build_new_subscription(ctx, params),
        BillingIntent::UpdateQuantity { current_id, params } => {
            build_update_quantity(ctx, current_id, params)
        }
        BillingIntent::UpdatePlan {
            current_id,
            params,
            scheduled,
        } => build_update_plan(ctx, current_id, params, scheduled),
        BillingIntent::Cancel {
            current_id,
            kind,
            prorate,
        } => build_cancel(ctx, current_id, kind, prorate),
        BillingIntent::Renew { current_id } => build_renew(ctx, current_id),
        BillingIntent::None => Ok(BillingPlan::new("none", customer_id)),
    }
}

// -----------------------------------------------------------------------------
// NewSubscription
// -----------------------------------------------------------------------------

fn build_new_subscription(
    ctx: &BuildContext<'_>,
    params: AttachParams,
) -> BillingResult<BillingPlan> {
    let mut plan = BillingPlan::new("new_subscription", ctx.full_cus.customer.id.clone());

    let trial_end = resolve_trial(ctx, &params, None)?;
    let cus_product = new_customer_product(ctx, &params, trial_end);

    plan.autumn.insert_entitlements = build_entitlements(ctx, &params, &cus_product);
    plan.autumn.line_items = price_line_items(&params, trial_end.is_none());
    if params.is_customized() {
        plan.autumn.custom_prices = params.prices().to_vec();
        plan.autumn.custom_entitlements = params.entitlements().to_vec();
        plan.autumn.custom_free_trial = params.custom_free_trial.clone();
    }

    let prices = params.prices();
    if !prices.is_empty() {
        if params.product.only_one_off() || prices.iter().all(|p| p.is_one_off()) {
            plan.provider.actions.push(ProviderAction::CreateInvoice {
                lines: plan.autumn.line_items.clone(),
                finalize_and_pay: ctx.billing_behavior == BillingBehavior::Immediate,
            });
        } else {
            plan.provider
                .actions
                .push(ProviderAction::CreateSubscription {
                    items: subscription_items(ctx.full_cus, &params),
                    trial_end,
                    charge_automatically: true,
                });
        }
    }

    plan.autumn.insert_customer_products.push(cus_product);
    Ok(plan)
}

// -----------------------------------------------------------------------------
// UpdateQuantity
// -----------------------------------------------------------------------------

fn build_update_quantity(
    ctx: &BuildContext<'_>,
    current_id: Uuid,
    params: AttachParams,
) -> BillingResult<BillingPlan> {
    let current = ctx
        .full_cus
        .product(current_id)
        .ok_or_else(|| BillingError::ProductNotFound(current_id.to_string()))?;
    let mut plan = BillingPlan::new("update_quantity", ctx.full_cus.customer.id.clone());

    let period = ctx.provider_sub.map(|sub| {
        BillingPeriod::new(sub.current_period_start, sub.current_period_end)
    });

    let mut items: Vec<PlanItem> = Vec::new();
    for option in &params.options {
        let old_qty = get_feature_options(&current.options, &option.feature_id)
            .map(|o| o.quantity)
            .unwrap_or(Decimal::ZERO);
        if old_qty == option.quantity {
            continue;
        }
        if option.quantity < Decimal::ZERO {
            return Err(BillingError::InvalidRequest(format!(
                "negative quantity for feature {}",
                option.feature_id
            )));
        }

        let (price, config) = prepaid_price_for(&current.product, &option.feature_id)
            .ok_or_else(|| {
                BillingError::InvalidRequest(format!(
                    "feature {} has no prepaid price on product {}",
                    option.feature_id, current.product.id
                ))
            })?;

        let delta_qty = option.quantity - old_qty;
        let delta_units = delta_qty * Decimal::from(config.billing_units);

        // Prorated charge or credit per the price's policy
        let old_amount =
            amount_for_quantity(&config.usage_tiers, config.billing_units, old_qty * Decimal::from(config.billing_units))?;
        let new_amount =
            amount_for_quantity(&config.usage_tiers, config.billing_units, option.quantity * Decimal::from(config.billing_units))?;
        let full_delta = new_amount - old_amount;

        let policy_line = quantity_change_line(
            ctx,
            period,
            price,
            &option.feature_id,
            full_delta,
            delta_qty > Decimal::ZERO,
        );
        if let Some(line) = policy_line {
            plan.autumn.line_items.push(line);
        }

        // Balance follows the purchased quantity: target = effective + delta
        let current_effective: Decimal = ctx
            .full_cus
            .entitlements_for_features(&[option.feature_id.as_str()])
            .iter()
            .map(|ce| ce.effective_balance(params.entity_id.as_deref()))
            .sum();
        let mut request = DeductionRequest::set_balance(
            option.feature_id.clone(),
            current_effective + delta_units,
        )
        .tracking_replaceables();
        request.entity_id = params.entity_id.clone();
        let outcome = deduct(ctx.full_cus, ctx.features, &request)?;
        plan.autumn.update_entitlements.extend(outcome.updates);

        items.push(PlanItem {
            price: price.clone(),
            quantity: Some(quantity_as_u64(option.quantity)?),
        });
    }

    if let (Some(sub), false) = (ctx.provider_sub, items.is_empty()) {
        plan.provider
            .actions
            .push(ProviderAction::UpdateSubscription {
                subscription_id: sub.id.clone(),
                items,
                proration: ProrationFlag::None,
                trial_end: None,
                cancel_at_period_end: None,
            });
    }

    let mut update = CustomerProductUpdate::for_product(current_id);
    update.options = Some(merge_options(&current.options, &params.options));
    plan.autumn.update_customer_product = Some(update);

    Ok(plan)
}

/// Line item for a prepaid quantity change, per the configured policy.
/// The decrease policy wins for decreases even when intervals also differ.
fn quantity_change_line(
    ctx: &BuildContext<'_>,
    period: Option<BillingPeriod>,
    price: &Price,
    feature_id: &str,
    full_delta: Decimal,
    is_increase: bool,
) -> Option<LineItem> {
    use autumn_shared::{OnDecrease, OnIncrease};

    let (prorate, due_now) = if is_increase {
        match price.proration.on_increase {
            OnIncrease::ProrateImmediately => (true, true),
            OnIncrease::ProrateNextCycle => (true, false),
            OnIncrease::NoProration => return None,
        }
    } else {
        match price.proration.on_decrease {
            OnDecrease::ProrateImmediately => (true, true),
            OnDecrease::ProrateNextCycle => (true, false),
            OnDecrease::NoProration => return None,
        }
    };

    let amount = match (prorate, period) {
        (true, Some(period)) => apply_proration(ctx.now_ms, period, full_delta),
        _ => full_delta,
    };
    if amount.is_zero() {
        return None;
    }
    Some(LineItem {
        description: format!("{feature_id} quantity change"),
        amount,
        price_id: Some(price.id),
        due_now: due_now && ctx.billing_behavior == BillingBehavior::Immediate,
    })
}

// -----------------------------------------------------------------------------
// UpdatePlan
// -----------------------------------------------------------------------------

fn build_update_plan(
    ctx: &BuildContext<'_>,
    current_id: Uuid,
    params: AttachParams,
    scheduled: bool,
) -> BillingResult<BillingPlan> {
    let current = ctx
        .full_cus
        .product(current_id)
        .ok_or_else(|| BillingError::ProductNotFound(current_id.to_string()))?;

    if scheduled {
        return build_scheduled_switch(ctx, current, params);
    }

    let mut plan = BillingPlan::new("update_plan", ctx.full_cus.customer.id.clone());

    let trial_end = resolve_trial(ctx, &params, Some(current))?;
    let mut cus_product = new_customer_product(ctx, &params, trial_end);
    cus_product.subscription_ids = current.subscription_ids.clone();

    let mut entitlements = build_entitlements(ctx, &params, &cus_product);
    carry_existing_usage(ctx, current, &mut entitlements);

    plan.autumn.insert_entitlements = entitlements;
    plan.autumn.delete_customer_product = Some(current.id);
    plan.autumn.line_items = switch_line_items(ctx, current, &params, trial_end.is_none());
    if params.is_customized() {
        plan.autumn.custom_prices = params.prices().to_vec();
        plan.autumn.custom_entitlements = params.entitlements().to_vec();
        plan.autumn.custom_free_trial = params.custom_free_trial.clone();
    }

    match (ctx.provider_sub, params.prices().is_empty()) {
        (Some(sub), true) => {
            // Switching to a free product ends the paid subscription now
            cus_product.subscription_ids.clear();
            plan.provider
                .actions
                .push(ProviderAction::CancelSubscription {
                    subscription_id: sub.id.clone(),
                    invoice_now: true,
                    prorate: true,
                });
        }
        (Some(sub), false) => {
            plan.provider
                .actions
                .push(ProviderAction::UpdateSubscription {
                    subscription_id: sub.id.clone(),
                    items: subscription_items(ctx.full_cus, &params),
                    proration: ProrationFlag::CreateProrations,
                    trial_end,
                    cancel_at_period_end: None,
                });
        }
        (None, false) => {
            // Free to paid: a fresh subscription
            if params.product.contains_recurring() {
                plan.provider
                    .actions
                    .push(ProviderAction::CreateSubscription {
                        items: subscription_items(ctx.full_cus, &params),
                        trial_end,
                        charge_automatically: true,
                    });
            } else {
                plan.provider.actions.push(ProviderAction::CreateInvoice {
                    lines: plan.autumn.line_items.clone(),
                    finalize_and_pay: ctx.billing_behavior == BillingBehavior::Immediate,
                });
            }
        }
        (None, true) => {}
    }

    plan.autumn.insert_customer_products.push(cus_product);
    Ok(plan)
}

/// Queue the switch at period end via a subscription schedule. The old
/// product stays live; the replacement is inserted as Scheduled.
fn build_scheduled_switch(
    ctx: &BuildContext<'_>,
    current: &CustomerProduct,
    params: AttachParams,
) -> BillingResult<BillingPlan> {
    let prices = params.prices();
    let has_one_off = prices.iter().any(|p| p.is_one_off());
    let has_recurring = prices.iter().any(|p| !p.is_one_off());
    if has_one_off && has_recurring {
        // One-off items require immediate purchase, which conflicts with
        // deferred activation
        return Err(BillingError::InvalidRequest(
            "cannot schedule a product mixing one-off and recurring prices".to_string(),
        ));
    }
    if has_one_off {
        return Err(BillingError::InvalidRequest(
            "cannot schedule a one-off product; attach it immediately instead".to_string(),
        ));
    }

    let sub = ctx.provider_sub.ok_or_else(|| {
        BillingError::Internal("scheduled switch requires a provider subscription".to_string())
    })?;
    let period_end = sub.current_period_end;

    let mut plan = BillingPlan::new("update_plan", ctx.full_cus.customer.id.clone());

    let mut cus_product = new_customer_product(ctx, &params, None);
    cus_product.status = CusProductStatus::Scheduled;
    cus_product.starts_at = period_end;
    cus_product.subscription_ids = current.subscription_ids.clone();

    // Entitlements materialize when the schedule phase begins; no balances
    // are inserted now
    if params.is_customized() {
        plan.autumn.custom_prices = prices.to_vec();
        plan.autumn.custom_entitlements = params.entitlements().to_vec();
    }

    if params.product.is_free() {
        // Nothing to run provider-side after the period: cancel at end
        plan.provider
            .actions
            .push(ProviderAction::UpdateSubscription {
                subscription_id: sub.id.clone(),
                items: vec![],
                proration: ProrationFlag::None,
                trial_end: None,
                cancel_at_period_end: Some(true),
            });
    } else {
        let current_items: Vec<PlanItem> = current
            .product
            .prices
            .iter()
            .filter(|p| !p.is_one_off())
            .map(|p| PlanItem {
                price: p.clone(),
                quantity: item_quantity(ctx.full_cus, &current.product, p, &current.options),
            })
            .collect();
        plan.provider.actions.push(ProviderAction::UpdateSchedule {
            schedule_id: sub.schedule_id.clone(),
            subscription_id: sub.id.clone(),
            phases: vec![
                SchedulePhase {
                    start: ctx.now_ms,
                    end: Some(period_end),
                    items: current_items,
                },
                SchedulePhase {
                    start: period_end,
                    end: None,
                    items: subscription_items(ctx.full_cus, &params),
                },
            ],
        });
    }

    plan.autumn.insert_customer_products.push(cus_product);
    Ok(plan)
}

// -----------------------------------------------------------------------------
// Cancel / Renew
// -----------------------------------------------------------------------------

fn build_cancel(
    ctx: &BuildContext<'_>,
    current_id: Uuid,
    kind: CancelKind,
    prorate: bool,
) -> BillingResult<BillingPlan> {
    let current = ctx
        .full_cus
        .product(current_id)
        .ok_or_else(|| BillingError::ProductNotFound(current_id.to_string()))?;
    let mut plan = BillingPlan::new("cancel", ctx.full_cus.customer.id.clone());

    match kind {
        CancelKind::Uncancel => {
            return Err(BillingError::Internal(
                "uncancel classifies as renew".to_string(),
            ))
        }
        CancelKind::Immediately => {
            if let Some(sub) = ctx.provider_sub {
                plan.provider
                    .actions
                    .push(ProviderAction::CancelSubscription {
                        subscription_id: sub.id.clone(),
                        invoice_now: prorate,
                        prorate,
                    });
            }
            let mut update = CustomerProductUpdate::for_product(current.id);
            update.status = Some(CusProductStatus::Expired);
            update.canceled_at = Some(Some(ctx.now_ms));
            update.ended_at = Some(Some(ctx.now_ms));
            plan.autumn.update_customer_product = Some(update);

            reactivate_default(ctx, current, &mut plan);
        }
        CancelKind::EndOfCycle => {
            // A sole trialing product has nothing billed yet: end the trial
            // subscription now instead of scheduling a cancellation
            let sole_on_sub = ctx
                .full_cus
                .live_products()
                .filter(|cp| {
                    cp.subscription_ids
                        .iter()
                        .any(|id| current.subscription_ids.contains(id))
                })
                .count()
                <= 1;
            if current.is_trialing(ctx.now_ms) && sole_on_sub {
                return build_cancel(ctx, current_id, CancelKind::Immediately, false);
            }

            if let Some(sub) = ctx.provider_sub {
                plan.provider
                    .actions
                    .push(ProviderAction::UpdateSubscription {
                        subscription_id: sub.id.clone(),
                        items: vec![],
                        proration: ProrationFlag::None,
                        trial_end: None,
                        cancel_at_period_end: Some(true),
                    });
            }
            let mut update = CustomerProductUpdate::for_product(current.id);
            update.canceled_at = Some(Some(ctx.now_ms));
            plan.autumn.update_customer_product = Some(update);
        }
    }

    Ok(plan)
}

/// Re-attach the group's default product when an immediate cancel leaves
/// the group with no live product
fn reactivate_default(
    ctx: &BuildContext<'_>,
    cancelled: &CustomerProduct,
    plan: &mut BillingPlan,
) {
    let Some(default) = ctx.default_product else {
        return;
    };
    if default.id == cancelled.product.id {
        return;
    }
    let remaining = ctx
        .full_cus
        .live_products()
        .filter(|cp| cp.id != cancelled.id && !cp.product.is_add_on)
        .any(|cp| cp.group() == cancelled.group());
    if remaining {
        return;
    }

    let mut params = AttachParams::new(default.clone());
    params.entity_id = cancelled.entity_id.clone();
    let cus_product = new_customer_product(ctx, &params, None);
    plan.autumn.insert_entitlements = build_entitlements(ctx, &params, &cus_product);
    plan.autumn.insert_customer_products.push(cus_product);
}

fn build_renew(ctx: &BuildContext<'_>, current_id: Uuid) -> BillingResult<BillingPlan> {
    let current = ctx
        .full_cus
        .product(current_id)
        .ok_or_else(|| BillingError::ProductNotFound(current_id.to_string()))?;
    let mut plan = BillingPlan::new("renew", ctx.full_cus.customer.id.clone());

    if current.status == CusProductStatus::Scheduled {
        // Dropping a scheduled switch: release the queued schedule and keep
        // the live product as-is
        plan.autumn.delete_customer_product = Some(current.id);
        if let Some(schedule_id) = current.schedule_ids.first() {
            plan.provider.actions.push(ProviderAction::ReleaseSchedule {
                schedule_id: schedule_id.clone(),
            });
        } else if let Some(sub) = ctx.provider_sub {
            if let Some(schedule_id) = &sub.schedule_id {
                plan.provider.actions.push(ProviderAction::ReleaseSchedule {
                    schedule_id: schedule_id.clone(),
                });
            }
        }
        return Ok(plan);
    }

    // Undo a pending end-of-cycle cancellation
    if let Some(sub) = ctx.provider_sub {
        plan.provider
            .actions
            .push(ProviderAction::UpdateSubscription {
                subscription_id: sub.id.clone(),
                items: vec![],
                proration: ProrationFlag::None,
                trial_end: None,
                cancel_at_period_end: Some(false),
            });
    }
    let mut update = CustomerProductUpdate::for_product(current.id);
    update.canceled_at = Some(None);
    plan.autumn.update_customer_product = Some(update);
    Ok(plan)
}

// -----------------------------------------------------------------------------
// Shared pieces
// -----------------------------------------------------------------------------

/// Trial resolution: explicit params render a trial immediately; absence of
/// params on a paid-recurring target inherits the provider subscription's
/// remaining trial; unique-fingerprint trials are granted once.
fn resolve_trial(
    ctx: &BuildContext<'_>,
    params: &AttachParams,
    current: Option<&CustomerProduct>,
) -> BillingResult<Option<i64>> {
    if let Some(trial) = &params.custom_free_trial {
        return Ok(Some(trial_end_ms(ctx.now_ms, trial)));
    }

    if let Some(trial) = &params.product.free_trial {
        if !(trial.unique_fingerprint && ctx.trial_consumed) {
            return Ok(Some(trial_end_ms(ctx.now_ms, trial)));
        }
    }

    // No trial on the target product
    let inherited = match (current, ctx.provider_sub) {
        (Some(_), Some(sub)) if sub.is_trialing(ctx.now_ms) && params.product.contains_recurring() => {
            sub.trial_end
        }
        _ => None,
    };

    if inherited.is_none() {
        if let Some(current) = current {
            if current.is_trialing(ctx.now_ms)
                && ctx.billing_behavior == BillingBehavior::NextCycleOnly
            {
                return Err(BillingError::InvalidRequest(
                    "cannot remove a trial while deferring all charges".to_string(),
                ));
            }
        }
    }

    Ok(inherited)
}

fn trial_end_ms(now_ms: i64, trial: &FreeTrial) -> i64 {
    now_ms + i64::from(trial.duration_days) * DAY_MS
}

fn new_customer_product(
    ctx: &BuildContext<'_>,
    params: &AttachParams,
    trial_end: Option<i64>,
) -> CustomerProduct {
    let status = if trial_end.is_some() {
        CusProductStatus::Trialing
    } else {
        CusProductStatus::Active
    };
    CustomerProduct {
        id: Uuid::new_v4(),
        customer_id: ctx.full_cus.customer.id.clone(),
        product: params.product.clone(),
        entity_id: params.entity_id.clone(),
        status,
        starts_at: ctx.now_ms,
        trial_ends_at: trial_end,
        canceled_at: None,
        ended_at: None,
        subscription_ids: vec![],
        schedule_ids: vec![],
        quantity: params.product_quantity,
        options: params.options.clone(),
    }
}

/// Fresh entitlement balances for an inserted product, at full allowance
/// scaled by quantity and prepaid purchases
fn build_entitlements(
    ctx: &BuildContext<'_>,
    params: &AttachParams,
    cus_product: &CustomerProduct,
) -> Vec<CustomerEntitlement> {
    params
        .entitlements()
        .iter()
        .map(|ent| {
            let related_price = params
                .prices()
                .iter()
                .find(|p| p.entitlement_id == Some(ent.id));
            let options = get_feature_options(&params.options, &ent.feature_id);
            let balance = starting_balance(ent, options, related_price, params.product_quantity);
            let usage_allowed = related_price
                .map(|p| {
                    matches!(
                        p.billing_kind(),
                        BillingKind::UsageInArrear | BillingKind::InArrearProrated
                    )
                })
                .unwrap_or(false);
            CustomerEntitlement {
                id: Uuid::new_v4(),
                customer_id: ctx.full_cus.customer.id.clone(),
                customer_product_id: Some(cus_product.id),
                entitlement: ent.clone(),
                balance,
                additional_balance: Decimal::ZERO,
                adjustment: Decimal::ZERO,
                entities: HashMap::new(),
                usage_allowed,
                unlimited: ent.allowance.is_unlimited(),
                next_reset_at: next_reset(ctx.now_ms, ent.interval, None),
                rollovers: vec![],
                replaceables: vec![],
                archived: false,
                version: 1,
            }
        })
        .collect()
}

/// Carry the old product's consumed usage and surviving rollovers into the
/// replacement entitlements, where the template opts in
fn carry_existing_usage(
    ctx: &BuildContext<'_>,
    current: &CustomerProduct,
    entitlements: &mut [CustomerEntitlement],
) {
    for new_ce in entitlements.iter_mut() {
        if !new_ce.entitlement.carry_from_previous {
            continue;
        }
        let Some(old_ce) = ctx
            .full_cus
            .entitlements
            .values()
            .find(|ce| {
                ce.customer_product_id == Some(current.id)
                    && ce.feature_id() == new_ce.feature_id()
            })
        else {
            continue;
        };

        if let Allowance::Fixed(old_allowance) = old_ce.entitlement.allowance {
            let unused_replaceables = Decimal::from(old_ce.replaceables.len() as u32);
            let existing_usage =
                (old_allowance - old_ce.base_balance(None) - unused_replaceables)
                    .max(Decimal::ZERO);
            new_ce.balance -= existing_usage;
        }

        if new_ce.entitlement.rollover.is_some() {
            new_ce.rollovers = old_ce.rollovers.clone();
        }
    }
}

/// Prorated credit for the outgoing product and charge for the incoming
/// one, for invoice preview
fn switch_line_items(
    ctx: &BuildContext<'_>,
    current: &CustomerProduct,
    params: &AttachParams,
    due_now: bool,
) -> Vec<LineItem> {
    let mut lines: Vec<LineItem> = Vec::new();
    let period = ctx
        .provider_sub
        .map(|sub| BillingPeriod::new(sub.current_period_start, sub.current_period_end));

    for price in current.product.prices.iter().filter(|p| !p.is_one_off()) {
        if let PriceConfig::Fixed(config) = &price.config {
            let credit = match period {
                Some(period) => apply_proration(ctx.now_ms, period, -config.amount),
                None => continue,
            };
            if !credit.is_zero() {
                lines.push(LineItem {
                    description: format!("{} (unused time)", current.product.name),
                    amount: credit,
                    price_id: Some(price.id),
                    due_now,
                });
            }
        }
    }
    for price in params.prices().iter().filter(|p| !p.is_one_off()) {
        if let PriceConfig::Fixed(config) = &price.config {
            let charge = match period {
                Some(period) => apply_proration(ctx.now_ms, period, config.amount),
                None => config.amount,
            };
            if !charge.is_zero() {
                lines.push(LineItem {
                    description: format!("{} (remaining time)", params.product.name),
                    amount: charge,
                    price_id: Some(price.id),
                    due_now,
                });
            }
        }
    }
    lines.extend(price_line_items(params, due_now).into_iter().filter(|li| {
        // Fixed recurring lines were already prorated above
        params
            .prices()
            .iter()
            .find(|p| Some(p.id) == li.price_id)
            .map(|p| matches!(p.config, PriceConfig::Usage(_)) || p.is_one_off())
            .unwrap_or(true)
    }));
    lines
}

/// Un-prorated lines for a product's prices at attach time
fn price_line_items(params: &AttachParams, due_now: bool) -> Vec<LineItem> {
    let mut lines = Vec::new();
    for price in params.prices() {
        match &price.config {
            PriceConfig::Fixed(config) => lines.push(LineItem {
                description: params.product.name.clone(),
                amount: config.amount,
                price_id: Some(price.id),
                due_now: due_now || price.is_one_off(),
            }),
            PriceConfig::Usage(config) => {
                if config.bill_when != BillWhen::EndOfPeriod {
                    let quantity = get_feature_options(&params.options, &config.feature_id)
                        .map(|o| o.quantity)
                        .unwrap_or(Decimal::ZERO);
                    if quantity.is_zero() {
                        continue;
                    }
                    let units = quantity * Decimal::from(config.billing_units);
                    if let Ok(amount) =
                        amount_for_quantity(&config.usage_tiers, config.billing_units, units)
                    {
                        lines.push(LineItem {
                            description: format!("{} ({} units)", config.feature_id, units),
                            amount,
                            price_id: Some(price.id),
                            due_now,
                        });
                    }
                }
            }
        }
    }
    lines
}

/// Recurring provider items for a subscription create/update
fn subscription_items(full_cus: &FullCustomer, params: &AttachParams) -> Vec<PlanItem> {
    params
        .prices()
        .iter()
        .filter(|p| !p.is_one_off())
        .map(|p| PlanItem {
            price: p.clone(),
            quantity: item_quantity(full_cus, &params.product, p, &params.options),
        })
        .collect()
}

/// Provider-side quantity for one price: product quantity for fixed prices,
/// purchased units for prepaid, current billed overage for continuous-use
/// prorated prices, none for plain metered
fn item_quantity(
    full_cus: &FullCustomer,
    product: &Product,
    price: &Price,
    options: &[FeatureOptions],
) -> Option<u64> {
    match &price.config {
        PriceConfig::Fixed(_) => Some(1),
        PriceConfig::Usage(config) => match config.bill_when {
            BillWhen::InAdvance | BillWhen::StartOfPeriod => {
                let quantity = get_feature_options(options, &config.feature_id)
                    .map(|o| o.quantity)
                    .or_else(|| {
                        product
                            .entitlement_for(&config.feature_id)
                            .map(|_| Decimal::ZERO)
                    })
                    .unwrap_or(Decimal::ZERO);
                quantity_as_u64(quantity).ok()
            }
            BillWhen::EndOfPeriod if config.should_prorate => quantity_as_u64(billed_overage(
                full_cus,
                &config.feature_id,
                config.billing_units,
            ))
            .ok(),
            BillWhen::EndOfPeriod => None,
        },
    }
}

/// Units currently billed as overage on a feature: the negative part of
/// each balance, rounded up to the price's billing units. Entity buckets
/// round individually before summing.
fn billed_overage(full_cus: &FullCustomer, feature_id: &str, billing_units: u32) -> Decimal {
    full_cus
        .entitlements_for_features(&[feature_id])
        .iter()
        .map(|ce| {
            if ce.is_entity_scoped() {
                ce.entities
                    .values()
                    .map(|b| {
                        round_usage((-(b.balance + b.adjustment)).max(Decimal::ZERO), billing_units)
                    })
                    .sum::<Decimal>()
            } else {
                round_usage(
                    (-ce.effective_balance(None)).max(Decimal::ZERO),
                    billing_units,
                )
            }
        })
        .sum()
}

fn prepaid_price_for<'a>(
    product: &'a Product,
    feature_id: &str,
) -> Option<(&'a Price, &'a autumn_shared::UsagePriceConfig)> {
    product.prices.iter().find_map(|p| match &p.config {
        PriceConfig::Usage(config)
            if config.feature_id == feature_id
                && matches!(config.bill_when, BillWhen::InAdvance | BillWhen::StartOfPeriod) =>
        {
            Some((p, config))
        }
        _ => None,
    })
}

fn merge_options(current: &[FeatureOptions], changes: &[FeatureOptions]) -> Vec<FeatureOptions> {
    let mut merged: Vec<FeatureOptions> = current.to_vec();
    for change in changes {
        match merged.iter_mut().find(|o| o.feature_id == change.feature_id) {
            Some(existing) => existing.quantity = change.quantity,
            None => merged.push(change.clone()),
        }
    }
    merged
}

fn quantity_as_u64(quantity: Decimal) -> BillingResult<u64> {
    use rust_decimal::prelude::ToPrimitive;
    quantity
        .to_u64()
        .ok_or_else(|| BillingError::InvalidRequest(format!("invalid quantity {quantity}")))
}
