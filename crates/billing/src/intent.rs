//! Billing intent classification
//!
//! A pure function from (current attached state, requested mutation) to a
//! closed intent enum. Each variant carries its own typed payload; the plan
//! builder dispatches on the variant with an exhaustive match, so a new
//! intent cannot be added without every branch being handled.

use autumn_shared::{CusProductStatus, CustomerProduct, Entitlement, FeatureOptions, FreeTrial,
    FullCustomer, Price, Product};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A requested attach / subscription-update mutation
#[derive(Debug, Clone, PartialEq)]
pub struct AttachParams {
    pub product: Product,
    pub options: Vec<FeatureOptions>,
    pub entity_id: Option<String>,
    pub product_quantity: u32,
    /// Caller-customized items replacing the product's defaults
    pub custom_prices: Option<Vec<Price>>,
    pub custom_entitlements: Option<Vec<Entitlement>>,
    pub custom_free_trial: Option<FreeTrial>,
    /// Apply a downgrade now instead of scheduling it at period end
    pub force_immediate: bool,
}

impl AttachParams {
    pub fn new(product: Product) -> Self {
        Self {
            product,
            options: vec![],
            entity_id: None,
            product_quantity: 1,
            custom_prices: None,
            custom_entitlements: None,
            custom_free_trial: None,
            force_immediate: false,
        }
    }

    pub fn is_customized(&self) -> bool {
        self.custom_prices.is_some()
            || self.custom_entitlements.is_some()
            || self.custom_free_trial.is_some()
    }

    /// Effective price set after customization
    pub fn prices(&self) -> &[Price] {
        self.custom_prices.as_deref().unwrap_or(&self.product.prices)
    }

    pub fn entitlements(&self) -> &[Entitlement] {
        self.custom_entitlements
            .as_deref()
            .unwrap_or(&self.product.entitlements)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelKind {
    Immediately,
    EndOfCycle,
    /// Undo a pending end-of-cycle cancellation
    Uncancel,
}

/// The classified mutation, with a typed payload per branch
#[derive(Debug, Clone, PartialEq)]
pub enum BillingIntent {
    /// No live product in the group (or an add-on attach)
    NewSubscription { params: AttachParams },
    /// Same product, only prepaid feature quantities changed
    UpdateQuantity {
        current_id: Uuid,
        params: AttachParams,
    },
    /// Different product or customized item structure
    UpdatePlan {
        current_id: Uuid,
        params: AttachParams,
        /// Downgrade deferred to period end via a schedule
        scheduled: bool,
    },
    Cancel {
        current_id: Uuid,
        kind: CancelKind,
        prorate: bool,
    },
    /// Re-attach a scheduled or cancel-pending product
    Renew { current_id: Uuid },
    /// Billing-identical to current state; no provider action
    None,
}

impl BillingIntent {
    pub fn name(&self) -> &'static str {
        match self {
            BillingIntent::NewSubscription { .. } => "new_subscription",
            BillingIntent::UpdateQuantity { .. } => "update_quantity",
            BillingIntent::UpdatePlan { .. } => "update_plan",
            BillingIntent::Cancel { .. } => "cancel",
            BillingIntent::Renew { .. } => "renew",
            BillingIntent::None => "none",
        }
    }
}

/// Classify an attach/update request against the customer's current state.
/// Pure: same inputs, same intent.
pub fn classify(full_cus: &FullCustomer, params: AttachParams) -> BillingResult<BillingIntent> {
    if params.product_quantity == 0 {
        return Err(BillingError::InvalidRequest(
            "product quantity must be at least 1".to_string(),
        ));
    }

    // Add-ons stack alongside main products, never replace them
    if params.product.is_add_on {
        return Ok(BillingIntent::NewSubscription { params });
    }

    let group = params.product.group.as_deref();
    let entity_id = params.entity_id.as_deref();

    let Some(current) = full_cus.main_product_for_group(group, entity_id) else {
        // A scheduled product with no live main product is re-activated
        if let Some(scheduled) = full_cus.scheduled_product_for_group(group, entity_id) {
            if scheduled.product.id == params.product.id {
                return Ok(BillingIntent::Renew {
                    current_id: scheduled.id,
                });
            }
        }
        return Ok(BillingIntent::NewSubscription { params });
    };

    if current.product.id == params.product.id && !params.is_customized() {
        if current.cancel_scheduled() {
            return Ok(BillingIntent::Renew {
                current_id: current.id,
            });
        }
        if options_equal(&current.options, &params.options)
            && current.quantity == params.product_quantity
        {
            return Ok(BillingIntent::None);
        }
        return Ok(BillingIntent::UpdateQuantity {
            current_id: current.id,
            params,
        });
    }

    // Price or item structure differs from here on
    if current.product.only_one_off() && !params.prices().is_empty() {
        return Err(BillingError::InvalidRequest(format!(
            "product {} is one-off; only entitlement changes are allowed",
            current.product.id
        )));
    }

    let is_downgrade_to_default =
        (params.product.is_free() || params.product.is_default) && !current.product.is_free();
    let scheduled = is_downgrade_to_default && !params.force_immediate;

    Ok(BillingIntent::UpdatePlan {
        current_id: current.id,
        params,
        scheduled,
    })
}

/// Classify a cancel request. Uncancel requires a pending end-of-cycle
/// cancellation; cancelling an already-ended product is invalid.
pub fn classify_cancel(
    full_cus: &FullCustomer,
    product_id: &str,
    entity_id: Option<&str>,
    kind: CancelKind,
    prorate: bool,
) -> BillingResult<BillingIntent> {
    let current = full_cus
        .customer_products
        .iter()
        .find(|cp| {
            cp.product.id == product_id
                && cp.entity_id.as_deref() == entity_id
                && (cp.is_live() || cp.status == CusProductStatus::Scheduled)
        })
        .ok_or_else(|| BillingError::ProductNotFound(product_id.to_string()))?;

    match kind {
        CancelKind::Uncancel => {
            if !current.cancel_scheduled() && current.status != CusProductStatus::Scheduled {
                return Err(BillingError::InvalidRequest(format!(
                    "product {product_id} has no pending cancellation"
                )));
            }
            Ok(BillingIntent::Renew {
                current_id: current.id,
            })
        }
        CancelKind::Immediately | CancelKind::EndOfCycle => {
            if current.cancel_scheduled() && kind == CancelKind::EndOfCycle {
                return Ok(BillingIntent::None);
            }
            Ok(BillingIntent::Cancel {
                current_id: current.id,
                kind,
                prorate,
            })
        }
    }
}

fn options_equal(a: &[FeatureOptions], b: &[FeatureOptions]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|opt| {
        b.iter()
            .any(|other| other.feature_id == opt.feature_id && other.quantity == opt.quantity)
    })
}

/// The product currently covering a group, for callers needing the record
pub fn current_for<'a>(
    full_cus: &'a FullCustomer,
    params: &AttachParams,
) -> Option<&'a CustomerProduct> {
    full_cus.main_product_for_group(params.product.group.as_deref(), params.entity_id.as_deref())
}
