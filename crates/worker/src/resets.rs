//! Entitlement reset sweep
//!
//! Finds entitlements whose interval reset is due, recomputes the period's
//! starting balance from the owning product (quantity and prepaid options
//! included), and writes the post-reset state with a version check. Rollover
//! creation is arbitrated through the (entitlement, period) claim, so two
//! workers racing on the same reset produce exactly one rollover row.

use autumn_billing::cache::EntitlementCache;
use autumn_billing::intervals::now_ms;
use autumn_billing::rollover::cycle_reset;
use autumn_billing::storage::{RolloverClaim, Storage};
use autumn_billing::BillingContext;
use autumn_shared::{get_feature_options, starting_balance, CustomerEntitlement, FullCustomer};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

const SWEEP_BATCH: i64 = 200;

/// Run one pass over due entitlements. Returns the number reset.
pub async fn run_reset_sweep(ctx: &BillingContext) -> usize {
    let now = now_ms();
    let due = match ctx.storage.due_entitlements(now, SWEEP_BATCH).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to fetch due entitlements");
            return 0;
        }
    };

    let mut reset_count = 0;
    for ce in due {
        match reset_one(ctx, &ce, now).await {
            Ok(true) => reset_count += 1,
            Ok(false) => {}
            Err(e) => {
                error!(
                    entitlement_id = %ce.id,
                    customer_id = %ce.customer_id,
                    error = %e,
                    "Entitlement reset failed"
                );
            }
        }
    }
    if reset_count > 0 {
        info!(count = reset_count, "Reset due entitlements");
    }
    reset_count
}

async fn reset_one(
    ctx: &BillingContext,
    due: &CustomerEntitlement,
    now: i64,
) -> anyhow::Result<bool> {
    // Re-read through the aggregate: another worker or a concurrent attach
    // may have already moved this entitlement
    let full_cus = ctx.storage.full_customer(&due.customer_id).await?;
    let Some(current) = full_cus.entitlements.get(&due.id) else {
        return Ok(false);
    };
    let Some(reset_at) = current.next_reset_at else {
        return Ok(false);
    };
    if reset_at > now {
        return Ok(false);
    }

    let outcome = cycle_reset(current, reset_balance(&full_cus, current), reset_at, None);

    if let Some(rollover) = &outcome.new_rollover {
        let claim = ctx
            .storage
            .claim_rollover_period(current.id, reset_at, rollover)
            .await?;
        if claim == RolloverClaim::Lost {
            // Another worker already reset this period
            return Ok(false);
        }
    }

    let mut next = current.clone();
    next.balance = outcome.balance;
    next.entities = outcome.entities;
    next.rollovers = outcome.rollovers;
    if let Some(rollover) = outcome.new_rollover {
        next.rollovers.push(rollover);
    }
    next.adjustment = Decimal::ZERO;
    next.next_reset_at = outcome.next_reset_at;

    if !ctx.storage.replace_entitlement(&next).await? {
        warn!(
            entitlement_id = %current.id,
            "Reset lost a version race, skipping until next sweep"
        );
        return Ok(false);
    }

    if let Err(e) = ctx.cache.invalidate(&due.customer_id).await {
        warn!(customer_id = %due.customer_id, error = %e, "cache invalidation failed");
    }
    Ok(true)
}

/// Starting balance for the new period, scaled by the owning product's
/// quantity and prepaid purchase options. Loose entitlements reset to
/// their plain allowance.
fn reset_balance(full_cus: &FullCustomer, ce: &CustomerEntitlement) -> Decimal {
    let Some(cus_product) = ce
        .customer_product_id
        .and_then(|id| full_cus.customer_products.iter().find(|cp| cp.id == id))
    else {
        return starting_balance(&ce.entitlement, None, None, 1);
    };
    starting_balance(
        &ce.entitlement,
        get_feature_options(&cus_product.options, ce.feature_id()),
        cus_product.product.price_for_entitlement(ce.entitlement.id),
        cus_product.quantity,
    )
}
