//! Billing service facade
//!
//! The public surface: each operation runs lock → load → classify → build →
//! finalize → execute against a [`BillingContext`]. Balance operations apply
//! their updates conditionally (version-checked) and re-read on conflict;
//! a held customer lock surfaces as a retryable error.

use autumn_shared::{FeatureOptions, FullCustomer};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::builder::{build, BuildContext};
use crate::context::BillingContext;
use crate::deduction::{deduct, DeductionOutcome, DeductionRequest};
use crate::error::{BillingError, BillingResult};
use crate::execute::{apply_deduction_outcome, execute_plan, ExecutionOutcome};
use crate::finalize::{finalize, CancelOverlay, FinalizeContext};
use crate::intent::{classify, classify_cancel, AttachParams, BillingIntent, CancelKind};
use crate::intervals::now_ms;
use crate::plan::LineItem;
use crate::provider::ProviderSubscription;

/// Version-conflict retries before giving up on a balance write
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Outcome of an attach / update / cancel operation
#[derive(Debug, Clone)]
pub struct BillingOutcome {
    pub intent: &'static str,
    pub due_now: Decimal,
    pub line_items: Vec<LineItem>,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    /// False when an idempotency key suppressed execution
    pub applied: bool,
}

#[derive(Debug, Clone)]
pub struct TrackResult {
    pub deducted: Decimal,
    /// Requested units that could not be satisfied
    pub remaining: Decimal,
    pub unlimited: bool,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub allowed: bool,
    /// Summed effective balance on the feature's own entitlements;
    /// `None` when unlimited
    pub balance: Option<Decimal>,
    pub unlimited: bool,
}

/// Subscription update: new prepaid quantities and/or a cancel request on
/// the current product
#[derive(Debug, Clone)]
pub struct UpdateSubscriptionParams {
    pub product_id: String,
    pub entity_id: Option<String>,
    pub options: Vec<FeatureOptions>,
    pub cancel: Option<CancelOverlay>,
}

pub struct BillingService {
    ctx: BillingContext,
}

impl BillingService {
    pub fn new(ctx: BillingContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &BillingContext {
        &self.ctx
    }

    /// Attach a product to a customer: subscribe, upgrade, downgrade, or
    /// quantity change, classified from current state
    pub async fn attach(
        &self,
        customer_id: &str,
        params: AttachParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<BillingOutcome> {
        let lock = self.ctx.cache.lock_customer(customer_id).await?;
        let result = self.attach_inner(customer_id, params, idempotency_key).await;
        self.ctx.cache.unlock_customer(lock).await;
        result
    }

    async fn attach_inner(
        &self,
        customer_id: &str,
        params: AttachParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<BillingOutcome> {
        let full_cus = self.ctx.storage.full_customer(customer_id).await?;
        let trial_consumed = self.trial_consumed(&full_cus, &params).await?;
        let provider_sub = self
            .provider_sub_for(
                &full_cus,
                params.product.group.as_deref(),
                params.entity_id.as_deref(),
            )
            .await?;

        let intent = classify(&full_cus, params)?;
        self.run_pipeline(
            &full_cus,
            provider_sub,
            trial_consumed,
            intent,
            None,
            idempotency_key,
        )
        .await
    }

    /// Change prepaid quantities and/or cancellation flags on the product
    /// the customer already has
    pub async fn update_subscription(
        &self,
        customer_id: &str,
        params: UpdateSubscriptionParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<BillingOutcome> {
        let lock = self.ctx.cache.lock_customer(customer_id).await?;
        let result = self
            .update_subscription_inner(customer_id, params, idempotency_key)
            .await;
        self.ctx.cache.unlock_customer(lock).await;
        result
    }

    async fn update_subscription_inner(
        &self,
        customer_id: &str,
        params: UpdateSubscriptionParams,
        idempotency_key: Option<&str>,
    ) -> BillingResult<BillingOutcome> {
        let full_cus = self.ctx.storage.full_customer(customer_id).await?;
        let current = full_cus
            .customer_products
            .iter()
            .find(|cp| {
                cp.product.id == params.product_id
                    && cp.entity_id == params.entity_id
                    && (cp.is_live() || cp.cancel_scheduled())
            })
            .ok_or_else(|| BillingError::ProductNotFound(params.product_id.clone()))?;

        let mut attach_params = AttachParams::new(current.product.clone());
        attach_params.options = params.options.clone();
        attach_params.entity_id = params.entity_id.clone();
        attach_params.product_quantity = current.quantity.max(1);

        let provider_sub = self
            .provider_sub_for(&full_cus, current.group(), params.entity_id.as_deref())
            .await?;
        let trial_consumed = self.trial_consumed(&full_cus, &attach_params).await?;
        let intent = classify(&full_cus, attach_params)?;
        self.run_pipeline(
            &full_cus,
            provider_sub,
            trial_consumed,
            intent,
            params.cancel,
            idempotency_key,
        )
        .await
    }

    pub async fn cancel(
        &self,
        customer_id: &str,
        product_id: &str,
        entity_id: Option<&str>,
        kind: CancelKind,
        prorate: bool,
    ) -> BillingResult<BillingOutcome> {
        let lock = self.ctx.cache.lock_customer(customer_id).await?;
        let result = self
            .cancel_inner(customer_id, product_id, entity_id, kind, prorate)
            .await;
        self.ctx.cache.unlock_customer(lock).await;
        result
    }

    async fn cancel_inner(
        &self,
        customer_id: &str,
        product_id: &str,
        entity_id: Option<&str>,
        kind: CancelKind,
        prorate: bool,
    ) -> BillingResult<BillingOutcome> {
        let full_cus = self.ctx.storage.full_customer(customer_id).await?;
        let intent = classify_cancel(&full_cus, product_id, entity_id, kind, prorate)?;
        let group = full_cus
            .customer_products
            .iter()
            .find(|cp| cp.product.id == product_id)
            .and_then(|cp| cp.product.group.clone());
        let provider_sub = self
            .provider_sub_for(&full_cus, group.as_deref(), entity_id)
            .await?;
        // No trial can be granted on a cancel path; the consumed flag only
        // stops the builder from starting one
        self.run_pipeline(&full_cus, provider_sub, true, intent, None, None)
            .await
    }

    /// Record usage against a feature. Capped at available balance unless
    /// the entitlements allow overage.
    pub async fn track(
        &self,
        customer_id: &str,
        feature_id: &str,
        amount: Decimal,
        entity_id: Option<&str>,
    ) -> BillingResult<TrackResult> {
        let mut request = DeductionRequest::track(feature_id, amount);
        request.reverse_order = self.ctx.config.reverse_deduction_order;
        if let Some(entity_id) = entity_id {
            request = request.with_entity(entity_id);
        }
        self.deduct_locked(customer_id, request).await
    }

    /// Would a deduction of `required` succeed right now? Never mutates.
    pub async fn check(
        &self,
        customer_id: &str,
        feature_id: &str,
        required: Decimal,
        entity_id: Option<&str>,
    ) -> BillingResult<CheckResult> {
        let full_cus = self.load_for_read(customer_id).await?;

        let mut request = DeductionRequest::track(feature_id, required).rejecting_overage();
        request.reverse_order = self.ctx.config.reverse_deduction_order;
        if let Some(entity_id) = entity_id {
            request = request.with_entity(entity_id);
        }

        let balance: Decimal = full_cus
            .entitlements_for_features(&[feature_id])
            .iter()
            .filter(|ce| !ce.unlimited)
            .map(|ce| ce.effective_balance(entity_id))
            .sum();

        match deduct(&full_cus, &self.ctx.features, &request) {
            Ok(outcome) if outcome.unlimited => Ok(CheckResult {
                allowed: true,
                balance: None,
                unlimited: true,
            }),
            Ok(_) => Ok(CheckResult {
                allowed: true,
                balance: Some(balance),
                unlimited: false,
            }),
            Err(BillingError::InsufficientBalance { .. }) => Ok(CheckResult {
                allowed: false,
                balance: Some(balance),
                unlimited: false,
            }),
            Err(e) => Err(e),
        }
    }

    /// Set the feature's effective balance to an absolute value. Applied
    /// through the deduction engine, so concurrent usage is preserved
    /// rather than overwritten.
    pub async fn update_balance(
        &self,
        customer_id: &str,
        feature_id: &str,
        target: Decimal,
        entity_id: Option<&str>,
    ) -> BillingResult<TrackResult> {
        let mut request = DeductionRequest::set_balance(feature_id, target);
        request.reverse_order = self.ctx.config.reverse_deduction_order;
        if let Some(entity_id) = entity_id {
            request = request.with_entity(entity_id);
        }
        self.deduct_locked(customer_id, request).await
    }

    /// Flush the cached aggregate into the durable store, feeding cached
    /// balances through the deduction engine as targets
    pub async fn sync_customer(&self, customer_id: &str) -> BillingResult<usize> {
        let lock = self.ctx.cache.lock_customer(customer_id).await?;
        let result = self.sync_customer_inner(customer_id).await;
        self.ctx.cache.unlock_customer(lock).await;
        result
    }

    async fn sync_customer_inner(&self, customer_id: &str) -> BillingResult<usize> {
        let Some(cached) = self.ctx.cache.get_customer(customer_id).await? else {
            return Ok(0);
        };
        let durable = self.ctx.storage.full_customer(customer_id).await?;
        let requests = crate::cache::sync_requests(&durable, &cached, &self.ctx.features);
        let count = requests.len();
        for request in &requests {
            self.deduct_durably(customer_id, request).await?;
        }
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Lock, deduct against durable state, unlock
    async fn deduct_locked(
        &self,
        customer_id: &str,
        request: DeductionRequest,
    ) -> BillingResult<TrackResult> {
        let lock = self.ctx.cache.lock_customer(customer_id).await?;
        let result = self.deduct_durably(customer_id, &request).await;
        self.ctx.cache.unlock_customer(lock).await;
        let outcome = result?;
        Ok(TrackResult {
            deducted: outcome.total_deducted,
            remaining: outcome.remaining,
            unlimited: outcome.unlimited,
        })
    }

    async fn run_pipeline(
        &self,
        full_cus: &FullCustomer,
        provider_sub: Option<ProviderSubscription>,
        trial_consumed: bool,
        intent: BillingIntent,
        cancel_overlay: Option<CancelOverlay>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<BillingOutcome> {
        let now = now_ms();
        let intent_name = intent.name();
        info!(
            customer_id = %full_cus.customer.id,
            intent = intent_name,
            "classified billing request"
        );

        let group = intent_group(full_cus, &intent);
        let build_ctx = BuildContext {
            full_cus,
            features: &self.ctx.features,
            provider_sub: provider_sub.as_ref(),
            default_product: self.ctx.default_product_for_group(group.as_deref()),
            now_ms: now,
            billing_behavior: self.ctx.config.billing_behavior,
            trial_consumed,
        };
        let plan = build(&build_ctx, intent)?;

        let finalize_ctx = FinalizeContext {
            full_cus,
            billing_behavior: self.ctx.config.billing_behavior,
            now_ms: now,
            cancel_overlay,
        };
        let plan = finalize(&finalize_ctx, plan)?;

        let due_now = plan.autumn.due_now();
        let line_items = plan.autumn.line_items.clone();
        let outcome: ExecutionOutcome =
            execute_plan(&self.ctx, full_cus, &plan, idempotency_key).await?;

        if let Err(e) = self.ctx.cache.invalidate(&full_cus.customer.id).await {
            warn!(customer_id = %full_cus.customer.id, error = %e, "cache invalidation failed");
        }

        Ok(BillingOutcome {
            intent: intent_name,
            due_now,
            line_items,
            subscription_id: outcome.subscription_id,
            invoice_id: outcome.invoice_id,
            applied: outcome.applied,
        })
    }

    /// Deduct against durable state, retrying on version conflicts
    async fn deduct_durably(
        &self,
        customer_id: &str,
        request: &DeductionRequest,
    ) -> BillingResult<DeductionOutcome> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut full_cus = self.ctx.storage.full_customer(customer_id).await?;
            let outcome = deduct(&full_cus, &self.ctx.features, request)?;
            if outcome.unlimited || outcome.updates.is_empty() {
                return Ok(outcome);
            }
            if apply_deduction_outcome(self.ctx.storage.as_ref(), &full_cus, &outcome).await? {
                apply_outcome_local(&mut full_cus, &outcome);
                if self.ctx.config.cache_enabled {
                    if let Err(e) = self.ctx.cache.set_customer(&full_cus).await {
                        warn!(customer_id = %customer_id, error = %e, "cache refresh failed");
                    }
                }
                return Ok(outcome);
            }
        }
        Err(BillingError::OperationInProgress {
            customer_id: customer_id.to_string(),
        })
    }

    async fn load_for_read(&self, customer_id: &str) -> BillingResult<FullCustomer> {
        if self.ctx.config.cache_enabled {
            match self.ctx.cache.get_customer(customer_id).await {
                Ok(Some(full_cus)) => return Ok(full_cus),
                Ok(None) => {}
                Err(e) => warn!(customer_id = %customer_id, error = %e, "cache read failed"),
            }
        }
        let full_cus = self.ctx.storage.full_customer(customer_id).await?;
        if self.ctx.config.cache_enabled {
            if let Err(e) = self.ctx.cache.set_customer(&full_cus).await {
                warn!(customer_id = %customer_id, error = %e, "cache fill failed");
            }
        }
        Ok(full_cus)
    }

    async fn trial_consumed(
        &self,
        full_cus: &FullCustomer,
        params: &AttachParams,
    ) -> BillingResult<bool> {
        let trial = params
            .custom_free_trial
            .as_ref()
            .or(params.product.free_trial.as_ref());
        let (Some(trial), Some(fingerprint)) = (trial, &full_cus.customer.fingerprint) else {
            return Ok(false);
        };
        if !trial.unique_fingerprint {
            return Ok(false);
        }
        self.ctx.storage.trial_fingerprint_used(fingerprint).await
    }

    /// Provider subscription backing the group's main product, if any
    async fn provider_sub_for(
        &self,
        full_cus: &FullCustomer,
        group: Option<&str>,
        entity_id: Option<&str>,
    ) -> BillingResult<Option<ProviderSubscription>> {
        let Some(current) = full_cus.main_product_for_group(group, entity_id) else {
            return Ok(None);
        };
        let Some(sub_id) = current.subscription_ids.first() else {
            return Ok(None);
        };
        Ok(Some(self.ctx.provider.get_subscription(sub_id).await?))
    }
}

/// Product group the intent operates on, for default-product lookup
fn intent_group(full_cus: &FullCustomer, intent: &BillingIntent) -> Option<String> {
    match intent {
        BillingIntent::NewSubscription { params }
        | BillingIntent::UpdateQuantity { params, .. }
        | BillingIntent::UpdatePlan { params, .. } => params.product.group.clone(),
        BillingIntent::Cancel { current_id, .. } | BillingIntent::Renew { current_id } => {
            full_cus
                .product(*current_id)
                .and_then(|cp| cp.product.group.clone())
        }
        BillingIntent::None => None,
    }
}

/// Mirror applied updates into the in-memory aggregate so the cache refresh
/// reflects the post-write state
fn apply_outcome_local(full_cus: &mut FullCustomer, outcome: &DeductionOutcome) {
    for (id, update) in &outcome.updates {
        full_cus.update_entitlement(*id, |ce| {
            ce.balance = update.balance;
            ce.additional_balance = update.additional_balance;
            ce.adjustment = update.adjustment;
            ce.entities = update.entities.clone();
            ce.rollovers = update.rollovers.clone();
            ce.version += 1;
        });
    }
    for ce in full_cus.entitlements.values_mut() {
        ce.replaceables
            .retain(|r| !outcome.deleted_replaceables.contains(&r.id));
    }
    for (ce_id, grant) in &outcome.new_replaceables {
        full_cus.update_entitlement(*ce_id, |ce| {
            ce.replaceables.push(grant.clone());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CustomerLock, EntitlementCache};
    use crate::context::BillingConfig;
    use crate::deduction::EntitlementUpdate;
    use crate::plan::{CustomerProductUpdate, ProviderAction};
    use crate::provider::{PaymentProvider, ProviderActionResult, ProviderInvoice};
    use crate::storage::{RolloverClaim, Storage};
    use async_trait::async_trait;
    use autumn_shared::{
        Allowance, CusProductStatus, Customer, CustomerEntitlement, CustomerProduct, Entitlement,
        Feature, FeatureType, IntervalConfig, Product, Replaceable, ResetInterval, Rollover,
    };
    use rust_decimal_macros::dec;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    /// Single-customer in-memory storage honoring the version contract
    struct MemStorage {
        state: Mutex<FullCustomer>,
        claimed: Mutex<HashSet<(Uuid, i64)>>,
        /// Force every conditional write to report a conflict
        fail_writes: bool,
    }

    impl MemStorage {
        fn new(full_cus: FullCustomer) -> Self {
            Self {
                state: Mutex::new(full_cus),
                claimed: Mutex::new(HashSet::new()),
                fail_writes: false,
            }
        }

        fn snapshot(&self) -> FullCustomer {
            self.state.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Storage for MemStorage {
        async fn full_customer(&self, customer_id: &str) -> BillingResult<FullCustomer> {
            let state = self.state.lock().unwrap();
            if state.customer.id != customer_id {
                return Err(BillingError::CustomerNotFound(customer_id.to_string()));
            }
            Ok(state.clone())
        }

        async fn insert_customer(&self, _customer: &Customer) -> BillingResult<()> {
            Ok(())
        }

        async fn set_provider_customer_id(
            &self,
            _customer_id: &str,
            provider_customer_id: &str,
        ) -> BillingResult<()> {
            self.state.lock().unwrap().customer.provider_customer_id =
                Some(provider_customer_id.to_string());
            Ok(())
        }

        async fn insert_customer_product(
            &self,
            cus_product: &CustomerProduct,
        ) -> BillingResult<()> {
            self.state
                .lock()
                .unwrap()
                .customer_products
                .push(cus_product.clone());
            Ok(())
        }

        async fn update_customer_product(
            &self,
            update: &CustomerProductUpdate,
        ) -> BillingResult<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(cp) = state.customer_products.iter_mut().find(|cp| cp.id == update.id) {
                if let Some(status) = update.status {
                    cp.status = status;
                }
                if let Some(canceled_at) = update.canceled_at {
                    cp.canceled_at = canceled_at;
                }
                if let Some(ended_at) = update.ended_at {
                    cp.ended_at = ended_at;
                }
                if let Some(trial_ends_at) = update.trial_ends_at {
                    cp.trial_ends_at = trial_ends_at;
                }
                if let Some(options) = &update.options {
                    cp.options = options.clone();
                }
                if let Some(quantity) = update.quantity {
                    cp.quantity = quantity;
                }
                if let Some(subscription_ids) = &update.subscription_ids {
                    cp.subscription_ids = subscription_ids.clone();
                }
                if let Some(schedule_ids) = &update.schedule_ids {
                    cp.schedule_ids = schedule_ids.clone();
                }
            }
            Ok(())
        }

        async fn expire_customer_products(&self, ids: &[Uuid], now_ms: i64) -> BillingResult<()> {
            let mut state = self.state.lock().unwrap();
            for cp in state.customer_products.iter_mut() {
                if ids.contains(&cp.id) {
                    cp.status = CusProductStatus::Expired;
                    cp.ended_at = Some(now_ms);
                }
            }
            for ce in state.entitlements.values_mut() {
                if ce
                    .customer_product_id
                    .map(|id| ids.contains(&id))
                    .unwrap_or(false)
                {
                    ce.archived = true;
                }
            }
            Ok(())
        }

        async fn insert_entitlement(&self, ce: &CustomerEntitlement) -> BillingResult<()> {
            self.state
                .lock()
                .unwrap()
                .entitlements
                .insert(ce.id, ce.clone());
            Ok(())
        }

        async fn update_entitlement(
            &self,
            id: Uuid,
            expected_version: i64,
            update: &EntitlementUpdate,
        ) -> BillingResult<bool> {
            if self.fail_writes {
                return Ok(false);
            }
            let mut state = self.state.lock().unwrap();
            let Some(ce) = state.entitlements.get_mut(&id) else {
                return Ok(false);
            };
            if ce.version != expected_version {
                return Ok(false);
            }
            ce.balance = update.balance;
            ce.additional_balance = update.additional_balance;
            ce.adjustment = update.adjustment;
            ce.entities = update.entities.clone();
            ce.rollovers = update.rollovers.clone();
            ce.version += 1;
            Ok(true)
        }

        async fn replace_entitlement(&self, new_ce: &CustomerEntitlement) -> BillingResult<bool> {
            if self.fail_writes {
                return Ok(false);
            }
            let mut state = self.state.lock().unwrap();
            let Some(ce) = state.entitlements.get_mut(&new_ce.id) else {
                return Ok(false);
            };
            if ce.version != new_ce.version {
                return Ok(false);
            }
            *ce = new_ce.clone();
            ce.version += 1;
            Ok(true)
        }

        async fn claim_rollover_period(
            &self,
            entitlement_id: Uuid,
            period_ms: i64,
            _rollover: &Rollover,
        ) -> BillingResult<RolloverClaim> {
            let won = self
                .claimed
                .lock()
                .unwrap()
                .insert((entitlement_id, period_ms));
            Ok(if won {
                RolloverClaim::Won
            } else {
                RolloverClaim::Lost
            })
        }

        async fn insert_replaceables(&self, grants: &[(Uuid, Replaceable)]) -> BillingResult<()> {
            let mut state = self.state.lock().unwrap();
            for (ce_id, grant) in grants {
                if let Some(ce) = state.entitlements.get_mut(ce_id) {
                    ce.replaceables.push(grant.clone());
                }
            }
            Ok(())
        }

        async fn delete_replaceables(&self, ids: &[Uuid]) -> BillingResult<()> {
            let mut state = self.state.lock().unwrap();
            for ce in state.entitlements.values_mut() {
                ce.replaceables.retain(|r| !ids.contains(&r.id));
            }
            Ok(())
        }

        async fn release_deferred_replaceables(&self, _customer_id: &str) -> BillingResult<u64> {
            Ok(0)
        }

        async fn trial_fingerprint_used(&self, _fingerprint: &str) -> BillingResult<bool> {
            Ok(false)
        }

        async fn record_idempotency_key(&self, _key: &str, _intent: &str) -> BillingResult<bool> {
            Ok(true)
        }

        async fn due_entitlements(
            &self,
            now_ms: i64,
            _limit: i64,
        ) -> BillingResult<Vec<CustomerEntitlement>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .entitlements
                .values()
                .filter(|ce| {
                    !ce.archived && ce.next_reset_at.map(|at| at <= now_ms).unwrap_or(false)
                })
                .cloned()
                .collect())
        }

        async fn features(&self) -> BillingResult<Vec<Feature>> {
            Ok(vec![])
        }

        async fn products(&self) -> BillingResult<Vec<Product>> {
            Ok(vec![])
        }
    }

    /// Cache double: always misses, always grants the lock
    struct MemCache;

    #[async_trait]
    impl EntitlementCache for MemCache {
        async fn get_customer(&self, _customer_id: &str) -> BillingResult<Option<FullCustomer>> {
            Ok(None)
        }

        async fn set_customer(&self, _full_cus: &FullCustomer) -> BillingResult<()> {
            Ok(())
        }

        async fn invalidate(&self, _customer_id: &str) -> BillingResult<()> {
            Ok(())
        }

        async fn lock_customer(&self, customer_id: &str) -> BillingResult<CustomerLock> {
            Ok(CustomerLock::Acquired {
                customer_id: customer_id.to_string(),
                token: "test-token".to_string(),
            })
        }

        async fn unlock_customer(&self, _lock: CustomerLock) {}
    }

    /// Provider double for flows with no provider actions
    struct NullProvider;

    #[async_trait]
    impl PaymentProvider for NullProvider {
        async fn ensure_customer(&self, _customer_id: &str) -> BillingResult<String> {
            Ok("prov_cus_test".to_string())
        }

        async fn apply(
            &self,
            _provider_customer_id: &str,
            action: &ProviderAction,
        ) -> BillingResult<ProviderActionResult> {
            Err(BillingError::Internal(format!(
                "unexpected provider action {action:?}"
            )))
        }

        async fn get_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<ProviderSubscription> {
            Err(BillingError::NotFound(format!(
                "subscription {subscription_id}"
            )))
        }

        async fn get_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice> {
            Err(BillingError::NotFound(format!("invoice {invoice_id}")))
        }
    }

    fn metered(id: &str) -> Feature {
        Feature {
            id: id.to_string(),
            name: id.to_string(),
            feature_type: FeatureType::Metered,
            credit_schema: vec![],
        }
    }

    fn free_plan_customer(allowance: rust_decimal::Decimal) -> FullCustomer {
        let ce = entitlement_with_balance(allowance);
        FullCustomer {
            customer: Customer {
                id: "cus_1".to_string(),
                fingerprint: None,
                provider_customer_id: None,
            },
            customer_products: vec![],
            entitlements: [(ce.id, ce)].into_iter().collect(),
        }
    }

    fn service_over(storage: Arc<MemStorage>) -> BillingService {
        let ctx = BillingContext::new(
            storage,
            Arc::new(MemCache),
            Arc::new(NullProvider),
            vec![metered("messages")],
            vec![],
            BillingConfig::default(),
        );
        BillingService::new(ctx)
    }

    fn entitlement_with_balance(balance: Decimal) -> CustomerEntitlement {
        CustomerEntitlement {
            id: Uuid::new_v4(),
            customer_id: "cus_1".to_string(),
            customer_product_id: None,
            entitlement: Entitlement {
                id: Uuid::new_v4(),
                feature_id: "messages".to_string(),
                allowance: Allowance::Fixed(dec!(100)),
                interval: Some(IntervalConfig::new(ResetInterval::Month, 1)),
                entity_feature_id: None,
                carry_from_previous: false,
                usage_limit: None,
                rollover: None,
            },
            balance,
            additional_balance: Decimal::ZERO,
            adjustment: Decimal::ZERO,
            entities: HashMap::new(),
            usage_allowed: false,
            unlimited: false,
            next_reset_at: None,
            rollovers: vec![],
            replaceables: vec![],
            archived: false,
            version: 3,
        }
    }

    #[test]
    fn test_local_apply_mirrors_update_and_bumps_version() {
        let ce = entitlement_with_balance(dec!(100));
        let id = ce.id;
        let mut full_cus = FullCustomer {
            customer: Customer {
                id: "cus_1".to_string(),
                fingerprint: None,
                provider_customer_id: None,
            },
            customer_products: vec![],
            entitlements: [(id, ce)].into_iter().collect(),
        };

        let mut outcome = DeductionOutcome::default();
        outcome.updates.insert(
            id,
            EntitlementUpdate {
                balance: dec!(60),
                additional_balance: Decimal::ZERO,
                adjustment: Decimal::ZERO,
                entities: HashMap::new(),
                rollovers: vec![],
                deducted: dec!(40),
            },
        );
        outcome.new_replaceables.push((
            id,
            Replaceable {
                id: Uuid::new_v4(),
                from_entity_id: None,
                delete_next_cycle: true,
            },
        ));

        apply_outcome_local(&mut full_cus, &outcome);
        let ce = &full_cus.entitlements[&id];
        assert_eq!(ce.balance, dec!(60));
        assert_eq!(ce.version, 4);
        assert_eq!(ce.replaceables.len(), 1);
    }

    #[tokio::test]
    async fn test_track_then_check_on_free_plan() {
        let storage = Arc::new(MemStorage::new(free_plan_customer(dec!(100))));
        let service = service_over(storage.clone());

        let tracked = service
            .track("cus_1", "messages", dec!(37.89), None)
            .await
            .unwrap();
        assert_eq!(tracked.deducted, dec!(37.89));
        assert_eq!(tracked.remaining, Decimal::ZERO);

        let durable = storage.snapshot();
        let remaining: Decimal = durable
            .entitlements
            .values()
            .map(|ce| ce.effective_balance(None))
            .sum();
        assert_eq!(remaining, dec!(62.11));

        let ok = service.check("cus_1", "messages", dec!(50), None).await.unwrap();
        assert!(ok.allowed);
        assert_eq!(ok.balance, Some(dec!(62.11)));

        let over = service.check("cus_1", "messages", dec!(70), None).await.unwrap();
        assert!(!over.allowed);
        assert_eq!(over.balance, Some(dec!(62.11)));
    }

    #[tokio::test]
    async fn test_update_balance_sets_absolute_target() {
        let storage = Arc::new(MemStorage::new(free_plan_customer(dec!(100))));
        let service = service_over(storage.clone());

        service
            .update_balance("cus_1", "messages", dec!(25), None)
            .await
            .unwrap();

        let durable = storage.snapshot();
        let remaining: Decimal = durable
            .entitlements
            .values()
            .map(|ce| ce.effective_balance(None))
            .sum();
        assert_eq!(remaining, dec!(25));
    }

    #[tokio::test]
    async fn test_write_conflicts_exhaust_into_retryable_error() {
        let mut storage = MemStorage::new(free_plan_customer(dec!(100)));
        storage.fail_writes = true;
        let service = service_over(Arc::new(storage));

        let err = service
            .track("cus_1", "messages", dec!(10), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::OperationInProgress { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rollover_period_claimed_once_per_entitlement() {
        let storage = MemStorage::new(free_plan_customer(dec!(100)));
        let entitlement_id = Uuid::new_v4();
        let rollover = Rollover {
            id: Uuid::new_v4(),
            amount: dec!(10),
            expires_at: None,
        };

        let first = storage
            .claim_rollover_period(entitlement_id, 1_000, &rollover)
            .await
            .unwrap();
        let second = storage
            .claim_rollover_period(entitlement_id, 1_000, &rollover)
            .await
            .unwrap();
        let next_period = storage
            .claim_rollover_period(entitlement_id, 2_000, &rollover)
            .await
            .unwrap();

        assert_eq!(first, RolloverClaim::Won);
        assert_eq!(second, RolloverClaim::Lost);
        assert_eq!(next_period, RolloverClaim::Won);
    }
}
