//! Webhook-driven convergence
//!
//! Provider webhooks carry subscription and invoice snapshots; this module
//! turns a snapshot into the product updates that make local state agree
//! with it. Convergence is a pure function over the aggregate, so the same
//! snapshot applied twice produces the same (empty) second plan.

use autumn_shared::{CusProductStatus, FullCustomer};
use tracing::info;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::plan::CustomerProductUpdate;
use crate::provider::{ProviderInvoice, ProviderInvoiceStatus, ProviderSubscription};
use crate::storage::Storage;

/// What a subscription snapshot requires of local state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Convergence {
    pub product_updates: Vec<CustomerProductUpdate>,
    /// Products to expire, entitlements archived alongside
    pub expire_ids: Vec<Uuid>,
}

impl Convergence {
    pub fn is_empty(&self) -> bool {
        self.product_updates.is_empty() && self.expire_ids.is_empty()
    }
}

/// Converge local products backed by this subscription to its state
pub fn converge_subscription(full_cus: &FullCustomer, sub: &ProviderSubscription) -> Convergence {
    let mut convergence = Convergence::default();

    for cp in &full_cus.customer_products {
        if !cp.subscription_ids.contains(&sub.id) || cp.status == CusProductStatus::Expired {
            continue;
        }

        let target = sub.status.to_local();
        if target == CusProductStatus::Expired {
            convergence.expire_ids.push(cp.id);
            // The scheduled replacement in this group takes over
            if let Some(scheduled) =
                full_cus.scheduled_product_for_group(cp.group(), cp.entity_id.as_deref())
            {
                let mut update = CustomerProductUpdate::for_product(scheduled.id);
                update.status = Some(CusProductStatus::Active);
                convergence.product_updates.push(update);
            }
            continue;
        }

        let mut update = CustomerProductUpdate::for_product(cp.id);
        if cp.status != target && cp.status != CusProductStatus::Scheduled {
            update.status = Some(target);
        }
        if cp.trial_ends_at != sub.trial_end {
            update.trial_ends_at = Some(sub.trial_end);
        }
        if sub.cancel_at_period_end && cp.canceled_at.is_none() {
            update.canceled_at = Some(Some(sub.current_period_end));
        } else if !sub.cancel_at_period_end && cp.cancel_scheduled() {
            update.canceled_at = Some(None);
        }
        if !update.is_empty() {
            convergence.product_updates.push(update);
        }
    }

    convergence
}

/// Converge from an invoice snapshot. Only a failed-collection invoice
/// moves product state; paid invoices converge through subscription events.
pub fn converge_invoice(full_cus: &FullCustomer, invoice: &ProviderInvoice) -> Convergence {
    let mut convergence = Convergence::default();
    let Some(sub_id) = &invoice.subscription_id else {
        return convergence;
    };
    if invoice.status != ProviderInvoiceStatus::Uncollectible {
        return convergence;
    }

    for cp in full_cus.live_products() {
        if !cp.subscription_ids.contains(sub_id) || cp.status == CusProductStatus::PastDue {
            continue;
        }
        let mut update = CustomerProductUpdate::for_product(cp.id);
        update.status = Some(CusProductStatus::PastDue);
        convergence.product_updates.push(update);
    }
    convergence
}

pub async fn apply_convergence(
    storage: &dyn Storage,
    convergence: &Convergence,
    now_ms: i64,
) -> BillingResult<()> {
    for update in &convergence.product_updates {
        storage.update_customer_product(update).await?;
    }
    if !convergence.expire_ids.is_empty() {
        storage
            .expire_customer_products(&convergence.expire_ids, now_ms)
            .await?;
    }
    Ok(())
}

/// Invoice-created: replaceable grants deferred to "next cycle" are now
/// billed for, so release them
pub async fn handle_invoice_created(
    storage: &dyn Storage,
    customer_id: &str,
) -> BillingResult<u64> {
    let released = storage.release_deferred_replaceables(customer_id).await?;
    if released > 0 {
        info!(
            customer_id = %customer_id,
            released,
            "released deferred replaceable grants on invoice creation"
        );
    }
    Ok(released)
}
