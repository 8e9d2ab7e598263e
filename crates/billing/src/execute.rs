//! Plan execution
//!
//! Applies a finalized [`BillingPlan`] in two stages: record changes to the
//! durable store first, then provider actions. A provider failure after the
//! durable stage leaves a state the reconciler converges from webhooks, so
//! no stage is ever retried blindly. Idempotency keys make retried execution
//! a no-op.

use autumn_shared::FullCustomer;
use tracing::{info, warn};

use crate::context::BillingContext;
use crate::deduction::DeductionOutcome;
use crate::error::{BillingError, BillingResult};
use crate::plan::BillingPlan;
use crate::provider::ProviderActionResult;
use crate::storage::Storage;

/// What execution produced, for the caller's response and for logging
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    /// False when the idempotency key was already seen and nothing ran
    pub applied: bool,
    pub subscription_id: Option<String>,
    pub schedule_id: Option<String>,
    pub invoice_id: Option<String>,
}

pub async fn execute_plan(
    ctx: &BillingContext,
    full_cus: &FullCustomer,
    plan: &BillingPlan,
    idempotency_key: Option<&str>,
) -> BillingResult<ExecutionOutcome> {
    if let Some(key) = idempotency_key {
        if !ctx.storage.record_idempotency_key(key, plan.intent).await? {
            info!(
                customer_id = %plan.customer_id,
                intent = plan.intent,
                key,
                "idempotency key already seen, skipping execution"
            );
            return Ok(ExecutionOutcome::default());
        }
    }
    if plan.is_noop() {
        return Ok(ExecutionOutcome {
            applied: true,
            ..Default::default()
        });
    }

    apply_record_changes(ctx, full_cus, plan).await?;

    let mut outcome = ExecutionOutcome {
        applied: true,
        ..Default::default()
    };
    if !plan.provider.actions.is_empty() {
        apply_provider_actions(ctx, full_cus, plan, &mut outcome).await?;
        backfill_provider_ids(ctx, plan, &outcome).await?;
    }

    info!(
        customer_id = %plan.customer_id,
        intent = plan.intent,
        subscription_id = ?outcome.subscription_id,
        "billing plan executed"
    );
    Ok(outcome)
}

/// Stage one: everything the durable store owns
async fn apply_record_changes(
    ctx: &BillingContext,
    full_cus: &FullCustomer,
    plan: &BillingPlan,
) -> BillingResult<()> {
    let storage = &ctx.storage;

    for (id, update) in &plan.autumn.update_entitlements {
        let current = full_cus.entitlements.get(id).ok_or_else(|| {
            BillingError::Internal(format!("plan updates unknown entitlement {id}"))
        })?;
        if !storage.update_entitlement(*id, current.version, update).await? {
            // Lost a version race; the caller re-reads and retries
            return Err(BillingError::OperationInProgress {
                customer_id: plan.customer_id.clone(),
            });
        }
    }

    for cus_product in &plan.autumn.insert_customer_products {
        storage.insert_customer_product(cus_product).await?;
    }
    for ce in &plan.autumn.insert_entitlements {
        storage.insert_entitlement(ce).await?;
    }
    if let Some(update) = &plan.autumn.update_customer_product {
        if !update.is_empty() {
            storage.update_customer_product(update).await?;
        }
    }
    if let Some(id) = plan.autumn.delete_customer_product {
        storage
            .expire_customer_products(&[id], crate::intervals::now_ms())
            .await?;
    }
    Ok(())
}

/// Stage two: provider calls, in plan order
async fn apply_provider_actions(
    ctx: &BillingContext,
    full_cus: &FullCustomer,
    plan: &BillingPlan,
    outcome: &mut ExecutionOutcome,
) -> BillingResult<()> {
    let provider_customer_id = match &full_cus.customer.provider_customer_id {
        Some(id) => id.clone(),
        None => {
            let id = ctx.provider.ensure_customer(&full_cus.customer.id).await?;
            ctx.storage
                .set_provider_customer_id(&full_cus.customer.id, &id)
                .await?;
            id
        }
    };

    for action in &plan.provider.actions {
        match ctx.provider.apply(&provider_customer_id, action).await? {
            ProviderActionResult::Subscription(sub) => {
                outcome.subscription_id = Some(sub.id);
            }
            ProviderActionResult::Invoice(invoice) => {
                outcome.invoice_id = Some(invoice.id);
            }
            ProviderActionResult::Schedule { id } => {
                outcome.schedule_id = Some(id);
            }
            ProviderActionResult::Released => {}
        }
    }
    Ok(())
}

/// Attach provider-assigned subscription/schedule ids to the products this
/// plan inserted or updated
async fn backfill_provider_ids(
    ctx: &BillingContext,
    plan: &BillingPlan,
    outcome: &ExecutionOutcome,
) -> BillingResult<()> {
    if outcome.subscription_id.is_none() && outcome.schedule_id.is_none() {
        return Ok(());
    }

    for cus_product in &plan.autumn.insert_customer_products {
        let mut update = crate::plan::CustomerProductUpdate::for_product(cus_product.id);
        if let Some(subscription_id) = &outcome.subscription_id {
            let mut ids = cus_product.subscription_ids.clone();
            if !ids.contains(subscription_id) {
                ids.push(subscription_id.clone());
            }
            update.subscription_ids = Some(ids);
        }
        if let Some(schedule_id) = &outcome.schedule_id {
            let mut ids = cus_product.schedule_ids.clone();
            if !ids.contains(schedule_id) {
                ids.push(schedule_id.clone());
            }
            update.schedule_ids = Some(ids);
        }
        if !update.is_empty() {
            ctx.storage.update_customer_product(&update).await?;
        }
    }
    Ok(())
}

/// Persist a deduction outcome: conditional entitlement writes plus the
/// replaceable grants it consumed or produced. Returns false when any write
/// lost its version race, in which case nothing further is applied and the
/// caller re-reads and retries.
pub async fn apply_deduction_outcome(
    storage: &dyn Storage,
    full_cus: &FullCustomer,
    outcome: &DeductionOutcome,
) -> BillingResult<bool> {
    for (id, update) in &outcome.updates {
        let current = full_cus.entitlements.get(id).ok_or_else(|| {
            BillingError::Internal(format!("outcome updates unknown entitlement {id}"))
        })?;
        if !storage.update_entitlement(*id, current.version, update).await? {
            warn!(entitlement_id = %id, "entitlement version conflict, retrying");
            return Ok(false);
        }
    }
    if !outcome.deleted_replaceables.is_empty() {
        storage
            .delete_replaceables(&outcome.deleted_replaceables)
            .await?;
    }
    if !outcome.new_replaceables.is_empty() {
        storage.insert_replaceables(&outcome.new_replaceables).await?;
    }
    Ok(true)
}
