//! Request-scoped billing context
//!
//! Every operation receives its handles through a [`BillingContext`] rather
//! than globals, so tests can swap storage, cache, and provider doubles
//! independently.

use std::sync::Arc;

use autumn_shared::{Feature, Product};

use crate::builder::BillingBehavior;
use crate::cache::EntitlementCache;
use crate::error::{BillingError, BillingResult};
use crate::provider::PaymentProvider;
use crate::storage::Storage;

/// Org-level billing configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Plan changes deferred to the next cycle instead of applied mid-cycle
    pub billing_behavior: BillingBehavior,
    /// Flip the deduction ordering so paid entitlements drain first
    pub reverse_deduction_order: bool,
    /// Cached aggregate reads allowed before falling through to storage
    pub cache_enabled: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            billing_behavior: BillingBehavior::Immediate,
            reverse_deduction_order: false,
            cache_enabled: true,
        }
    }
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let billing_behavior = match std::env::var("BILLING_BEHAVIOR").ok().as_deref() {
            Some("next_cycle_only") => BillingBehavior::NextCycleOnly,
            Some("immediate") | None => BillingBehavior::Immediate,
            Some(other) => {
                return Err(BillingError::Config(format!(
                    "unknown BILLING_BEHAVIOR: {other}"
                )))
            }
        };
        Ok(Self {
            billing_behavior,
            reverse_deduction_order: std::env::var("REVERSE_DEDUCTION_ORDER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            cache_enabled: std::env::var("ENTITLEMENT_CACHE_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        })
    }
}

/// Handles and catalog for one billing operation
#[derive(Clone)]
pub struct BillingContext {
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<dyn EntitlementCache>,
    pub provider: Arc<dyn PaymentProvider>,
    /// Feature catalog for the org, loaded once per request
    pub features: Arc<Vec<Feature>>,
    /// Product catalog for the org, for default-product lookups
    pub products: Arc<Vec<Product>>,
    pub config: BillingConfig,
}

impl BillingContext {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: Arc<dyn EntitlementCache>,
        provider: Arc<dyn PaymentProvider>,
        features: Vec<Feature>,
        products: Vec<Product>,
        config: BillingConfig,
    ) -> Self {
        Self {
            storage,
            cache,
            provider,
            features: Arc::new(features),
            products: Arc::new(products),
            config,
        }
    }

    pub fn feature(&self, feature_id: &str) -> BillingResult<&Feature> {
        self.features
            .iter()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| BillingError::NotFound(format!("feature {feature_id}")))
    }

    /// Fallback product re-activated when a paid product in the group ends
    pub fn default_product_for_group(&self, group: Option<&str>) -> Option<&Product> {
        self.products
            .iter()
            .find(|p| p.is_default && p.group.as_deref() == group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BillingConfig::default();
        assert_eq!(config.billing_behavior, BillingBehavior::Immediate);
        assert!(!config.reverse_deduction_order);
        assert!(config.cache_enabled);
    }
}
