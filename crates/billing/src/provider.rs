//! Payment-provider interface
//!
//! Provider-neutral objects and the trait the execution layer drives. The
//! core never sees a concrete provider type; the Stripe adapter lives in
//! [`crate::stripe_provider`].

use async_trait::async_trait;
use autumn_shared::CusProductStatus;

use crate::error::BillingResult;
use crate::plan::ProviderAction;

/// Provider-side subscription lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSubStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    Unpaid,
    Other,
}

impl ProviderSubStatus {
    /// Local status a subscription in this state converges to
    pub fn to_local(self) -> CusProductStatus {
        match self {
            ProviderSubStatus::Active => CusProductStatus::Active,
            ProviderSubStatus::Trialing => CusProductStatus::Trialing,
            ProviderSubStatus::PastDue | ProviderSubStatus::Unpaid => CusProductStatus::PastDue,
            ProviderSubStatus::Canceled | ProviderSubStatus::Incomplete => {
                CusProductStatus::Expired
            }
            ProviderSubStatus::Other => CusProductStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderSubItem {
    pub item_id: String,
    pub price_id: String,
    pub quantity: Option<u64>,
}

/// Snapshot of a provider subscription, as delivered by API reads and
/// webhook payloads
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: ProviderSubStatus,
    /// Epoch ms
    pub current_period_start: i64,
    pub current_period_end: i64,
    pub trial_end: Option<i64>,
    pub cancel_at_period_end: bool,
    pub items: Vec<ProviderSubItem>,
    pub schedule_id: Option<String>,
}

impl ProviderSubscription {
    pub fn is_trialing(&self, now_ms: i64) -> bool {
        self.status == ProviderSubStatus::Trialing
            || self.trial_end.map(|t| t > now_ms).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderInvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderInvoice {
    pub id: String,
    pub status: ProviderInvoiceStatus,
    /// Minor currency units (cents)
    pub total: i64,
    pub subscription_id: Option<String>,
}

/// Result of applying one provider action
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderActionResult {
    Subscription(ProviderSubscription),
    Invoice(ProviderInvoice),
    Schedule { id: String },
    Released,
}

impl ProviderActionResult {
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            ProviderActionResult::Subscription(sub) => Some(&sub.id),
            _ => None,
        }
    }
}

/// Abstract payment provider. One method per concern: apply a neutral plan
/// action, or read back current truth for reconciliation.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Provider-side customer reference, creating the customer if needed
    async fn ensure_customer(&self, customer_id: &str) -> BillingResult<String>;

    async fn apply(
        &self,
        provider_customer_id: &str,
        action: &ProviderAction,
    ) -> BillingResult<ProviderActionResult>;

    async fn get_subscription(&self, subscription_id: &str)
        -> BillingResult<ProviderSubscription>;

    async fn get_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_convergence_mapping() {
        assert_eq!(
            ProviderSubStatus::Trialing.to_local(),
            CusProductStatus::Trialing
        );
        assert_eq!(
            ProviderSubStatus::Unpaid.to_local(),
            CusProductStatus::PastDue
        );
        assert_eq!(
            ProviderSubStatus::Canceled.to_local(),
            CusProductStatus::Expired
        );
    }
}
