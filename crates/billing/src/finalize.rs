//! Plan finalization
//!
//! Post-processes a built plan before execution: rejects defer-all-charges
//! requests that must charge now, overlays a simultaneous cancel request
//! onto the computed plan, and validates internal consistency. A plan that
//! fails consistency indicates a builder defect, not bad input.

use autumn_shared::FullCustomer;
use rust_decimal::Decimal;

use crate::builder::BillingBehavior;
use crate::error::{BillingError, BillingResult};
use crate::intent::CancelKind;
use crate::plan::{BillingPlan, CustomerProductUpdate, ProrationFlag, ProviderAction};

/// Cancel request arriving alongside a plan change; merged into the plan
/// rather than run as a separate pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOverlay {
    pub kind: CancelKind,
    pub prorate: bool,
}

#[derive(Debug, Clone)]
pub struct FinalizeContext<'a> {
    pub full_cus: &'a FullCustomer,
    pub billing_behavior: BillingBehavior,
    pub now_ms: i64,
    pub cancel_overlay: Option<CancelOverlay>,
}

pub fn finalize(ctx: &FinalizeContext<'_>, mut plan: BillingPlan) -> BillingResult<BillingPlan> {
    check_defer_rules(ctx, &plan)?;
    if let Some(overlay) = ctx.cancel_overlay {
        apply_cancel_overlay(ctx, &mut plan, overlay)?;
    }
    check_consistency(ctx, &plan)?;
    Ok(plan)
}

/// `next_cycle_only` cannot defer a charge the plan requires now:
/// free-to-paid transitions, trial removal, or any due-now line total.
fn check_defer_rules(ctx: &FinalizeContext<'_>, plan: &BillingPlan) -> BillingResult<()> {
    if ctx.billing_behavior != BillingBehavior::NextCycleOnly {
        return Ok(());
    }

    let outgoing = plan
        .autumn
        .delete_customer_product
        .and_then(|id| ctx.full_cus.product(id));

    let from_free = outgoing.map(|cp| cp.product.is_free()).unwrap_or(true);
    if from_free && plan.provider.creates_subscription() {
        return Err(BillingError::InvalidRequest(
            "free to paid transition must charge now; next_cycle_only is not allowed".to_string(),
        ));
    }

    let trial_removed = outgoing
        .map(|cp| cp.is_trialing(ctx.now_ms))
        .unwrap_or(false)
        && plan
            .autumn
            .insert_customer_products
            .iter()
            .all(|cp| cp.trial_ends_at.is_none());
    if trial_removed {
        return Err(BillingError::InvalidRequest(
            "removing a trial is not allowed with next_cycle_only".to_string(),
        ));
    }

    if plan.autumn.due_now() > Decimal::ZERO {
        return Err(BillingError::InvalidRequest(
            "plan produces an immediate charge; next_cycle_only is not allowed".to_string(),
        ));
    }

    Ok(())
}

/// Merge the cancel fields into the already-computed update / inserted
/// products, and fold the flag into an existing subscription update when
/// the plan already touches the subscription.
fn apply_cancel_overlay(
    ctx: &FinalizeContext<'_>,
    plan: &mut BillingPlan,
    overlay: CancelOverlay,
) -> BillingResult<()> {
    let canceled_at: Option<Option<i64>> = match overlay.kind {
        CancelKind::EndOfCycle => Some(Some(ctx.now_ms)),
        CancelKind::Uncancel => Some(None),
        CancelKind::Immediately => {
            return Err(BillingError::InvalidRequest(
                "immediate cancel cannot be combined with a plan change".to_string(),
            ))
        }
    };

    if let Some(update) = plan.autumn.update_customer_product.as_mut() {
        update.canceled_at = canceled_at;
    } else if let Some(inserted) = plan.autumn.insert_customer_products.first() {
        let mut update = CustomerProductUpdate::for_product(inserted.id);
        update.canceled_at = canceled_at;
        plan.autumn.update_customer_product = Some(update);
    }
    for inserted in plan.autumn.insert_customer_products.iter_mut() {
        inserted.canceled_at = match canceled_at {
            Some(value) => value,
            None => inserted.canceled_at,
        };
    }

    let flag = Some(overlay.kind == CancelKind::EndOfCycle);
    let mut folded = false;
    for action in plan.provider.actions.iter_mut() {
        if let ProviderAction::UpdateSubscription {
            cancel_at_period_end,
            ..
        } = action
        {
            *cancel_at_period_end = flag;
            folded = true;
        }
    }
    if !folded {
        // Cancel the subscription the affected product runs on
        let subscription_id = plan
            .autumn
            .update_customer_product
            .as_ref()
            .and_then(|u| ctx.full_cus.product(u.id))
            .and_then(|cp| cp.subscription_ids.first().cloned());
        if let Some(subscription_id) = subscription_id {
            plan.provider
                .actions
                .push(ProviderAction::UpdateSubscription {
                    subscription_id,
                    items: vec![],
                    proration: ProrationFlag::None,
                    trial_end: None,
                    cancel_at_period_end: flag,
                });
        }
    }

    Ok(())
}

/// Internal consistency: inserted products may only reference subscription
/// ids that already exist; a deleted product may not hold replaceables
/// still awaiting deferred deletion.
fn check_consistency(ctx: &FinalizeContext<'_>, plan: &BillingPlan) -> BillingResult<()> {
    let known_sub_ids: Vec<&str> = ctx
        .full_cus
        .customer_products
        .iter()
        .flat_map(|cp| cp.subscription_ids.iter().map(String::as_str))
        .collect();

    for inserted in &plan.autumn.insert_customer_products {
        for sub_id in &inserted.subscription_ids {
            if !known_sub_ids.contains(&sub_id.as_str()) {
                return Err(BillingError::Internal(format!(
                    "plan inserts product {} referencing unknown subscription {}",
                    inserted.product.id, sub_id
                )));
            }
        }
    }

    if let Some(deleted_id) = plan.autumn.delete_customer_product {
        let deferred = ctx
            .full_cus
            .entitlements
            .values()
            .filter(|ce| ce.customer_product_id == Some(deleted_id))
            .flat_map(|ce| ce.replaceables.iter())
            .any(|r| r.delete_next_cycle)
            && !plan.autumn.update_entitlements.keys().any(|id| {
                ctx.full_cus
                    .entitlements
                    .get(id)
                    .map(|ce| ce.customer_product_id == Some(deleted_id))
                    .unwrap_or(false)
            });
        if deferred {
            return Err(BillingError::Internal(format!(
                "plan deletes product {deleted_id} with unresolved deferred replaceables"
            )));
        }
    }

    Ok(())
}
