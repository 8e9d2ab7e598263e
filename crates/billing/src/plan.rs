//! Billing plan types
//!
//! A built plan has two halves: the [`AutumnPlan`] describing record changes
//! to our own store, and the [`ProviderPlan`] describing payment-provider
//! actions in neutral terms. The execution layer persists the first, then
//! translates the second into concrete provider calls.

use std::collections::HashMap;

use autumn_shared::{
    CusProductStatus, CustomerEntitlement, CustomerProduct, Entitlement, FeatureOptions,
    FreeTrial, Price,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::deduction::EntitlementUpdate;

/// One display / invoice line, flagged by whether it charges now or on the
/// next invoice
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LineItem {
    pub description: String,
    pub amount: Decimal,
    pub price_id: Option<Uuid>,
    /// Attributable to "now" (immediate charge) vs deferred
    pub due_now: bool,
}

/// Partial update to an existing customer product; `None` fields are left
/// untouched, double-`Option` fields can be explicitly cleared
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CustomerProductUpdate {
    pub id: Uuid,
    pub status: Option<CusProductStatus>,
    pub canceled_at: Option<Option<i64>>,
    pub ended_at: Option<Option<i64>>,
    pub trial_ends_at: Option<Option<i64>>,
    pub options: Option<Vec<FeatureOptions>>,
    pub quantity: Option<u32>,
    pub subscription_ids: Option<Vec<String>>,
    pub schedule_ids: Option<Vec<String>>,
}

impl CustomerProductUpdate {
    pub fn for_product(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.canceled_at.is_none()
            && self.ended_at.is_none()
            && self.trial_ends_at.is_none()
            && self.options.is_none()
            && self.quantity.is_none()
            && self.subscription_ids.is_none()
            && self.schedule_ids.is_none()
    }
}

/// The record-change half of a plan
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AutumnPlan {
    pub insert_customer_products: Vec<CustomerProduct>,
    pub insert_entitlements: Vec<CustomerEntitlement>,
    pub update_customer_product: Option<CustomerProductUpdate>,
    /// Expire (archive), never physically delete
    pub delete_customer_product: Option<Uuid>,
    pub update_entitlements: HashMap<Uuid, EntitlementUpdate>,
    /// Caller-customized items owned by the new customer product
    pub custom_prices: Vec<Price>,
    pub custom_entitlements: Vec<Entitlement>,
    pub custom_free_trial: Option<FreeTrial>,
    /// Invoice preview lines
    pub line_items: Vec<LineItem>,
}

impl AutumnPlan {
    /// Total attributable to "now", for the finalizer's defer checks
    pub fn due_now(&self) -> Decimal {
        self.line_items
            .iter()
            .filter(|li| li.due_now)
            .map(|li| li.amount)
            .sum()
    }
}

/// An item on a provider subscription or schedule phase
#[derive(Debug, Clone, PartialEq)]
pub struct PlanItem {
    pub price: Price,
    /// `None` for metered items where the provider reports usage
    pub quantity: Option<u64>,
}

/// Provider-neutral proration flag for subscription updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProrationFlag {
    #[default]
    CreateProrations,
    None,
    AlwaysInvoice,
}

/// One time-bounded phase of a subscription schedule
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePhase {
    pub start: i64,
    pub end: Option<i64>,
    pub items: Vec<PlanItem>,
}

/// Provider actions in neutral terms; the Stripe adapter translates these
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderAction {
    CreateSubscription {
        items: Vec<PlanItem>,
        trial_end: Option<i64>,
        /// Collect payment immediately vs send an invoice
        charge_automatically: bool,
    },
    UpdateSubscription {
        subscription_id: String,
        items: Vec<PlanItem>,
        proration: ProrationFlag,
        trial_end: Option<i64>,
        cancel_at_period_end: Option<bool>,
    },
    CancelSubscription {
        subscription_id: String,
        invoice_now: bool,
        prorate: bool,
    },
    CreateInvoice {
        lines: Vec<LineItem>,
        /// Finalize and attempt payment immediately
        finalize_and_pay: bool,
    },
    UpdateSchedule {
        /// `None` creates a new schedule from the current subscription
        schedule_id: Option<String>,
        subscription_id: String,
        phases: Vec<SchedulePhase>,
    },
    ReleaseSchedule {
        schedule_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderPlan {
    pub actions: Vec<ProviderAction>,
}

impl ProviderPlan {
    pub fn creates_subscription(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, ProviderAction::CreateSubscription { .. }))
    }

    pub fn touches_subscription(&self, subscription_id: &str) -> bool {
        self.actions.iter().any(|a| match a {
            ProviderAction::UpdateSubscription {
                subscription_id: id,
                ..
            }
            | ProviderAction::CancelSubscription {
                subscription_id: id,
                ..
            }
            | ProviderAction::UpdateSchedule {
                subscription_id: id,
                ..
            } => id == subscription_id,
            _ => false,
        })
    }
}

/// A fully built plan, ready for finalization and execution
#[derive(Debug, Clone, PartialEq)]
pub struct BillingPlan {
    /// Classification this plan was built from, for logs and idempotency
    pub intent: &'static str,
    pub customer_id: String,
    pub autumn: AutumnPlan,
    pub provider: ProviderPlan,
}

impl BillingPlan {
    pub fn new(intent: &'static str, customer_id: impl Into<String>) -> Self {
        Self {
            intent,
            customer_id: customer_id.into(),
            autumn: AutumnPlan::default(),
            provider: ProviderPlan::default(),
        }
    }

    /// A plan with no record changes and no provider actions
    pub fn is_noop(&self) -> bool {
        self.autumn == AutumnPlan::default() && self.provider.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_due_now_sums_only_immediate_lines() {
        let mut plan = AutumnPlan::default();
        plan.line_items = vec![
            LineItem {
                description: "Pro (prorated)".to_string(),
                amount: dec!(15),
                price_id: None,
                due_now: true,
            },
            LineItem {
                description: "Pro renewal".to_string(),
                amount: dec!(49),
                price_id: None,
                due_now: false,
            },
        ];
        assert_eq!(plan.due_now(), dec!(15));
    }

    #[test]
    fn test_empty_update_detected() {
        let update = CustomerProductUpdate::for_product(Uuid::new_v4());
        assert!(update.is_empty());
        let plan = BillingPlan::new("none", "cus_1");
        assert!(plan.is_noop());
    }
}
