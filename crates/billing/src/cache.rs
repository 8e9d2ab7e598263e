//! Entitlement cache and customer lock
//!
//! A fast in-memory copy of the customer aggregate serves reads and
//! provisional balance checks; the durable store stays authoritative.
//! Synchronization never overwrites blindly: the cached balance is fed into
//! the deduction engine as a target balance, so durable writes from other
//! paths (webhooks, admin edits) are preserved.
//!
//! The per-customer lock serializes balance-mutating operations. It degrades
//! gracefully: when the cache backend is down the operation proceeds without
//! the lock, surfacing only a warning.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use autumn_shared::{Feature, FullCustomer};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::deduction::DeductionRequest;
use crate::error::{BillingError, BillingResult};

/// Cached aggregate TTL; short, because the durable store wins on expiry
pub const CUSTOMER_TTL: Duration = Duration::from_secs(60);
/// Lock TTL; long enough for a full plan execution, short enough that a
/// crashed holder does not wedge the customer
pub const LOCK_TTL: Duration = Duration::from_secs(10);

/// Outcome of a lock attempt. `Unavailable` means the backend is down and
/// the caller proceeds lockless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerLock {
    Acquired { customer_id: String, token: String },
    Unavailable,
}

#[async_trait]
pub trait EntitlementCache: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> BillingResult<Option<FullCustomer>>;
    async fn set_customer(&self, full_cus: &FullCustomer) -> BillingResult<()>;
    async fn invalidate(&self, customer_id: &str) -> BillingResult<()>;

    /// Acquire the customer's mutation lock. Errors with
    /// [`BillingError::OperationInProgress`] when another holder exists;
    /// returns [`CustomerLock::Unavailable`] when the backend is down.
    async fn lock_customer(&self, customer_id: &str) -> BillingResult<CustomerLock>;
    async fn unlock_customer(&self, lock: CustomerLock);
}

/// Target-balance sync requests reconciling the durable aggregate to the
/// cache's view. One request per feature whose effective balance diverges;
/// running them through the deduction engine preserves concurrent durable
/// writes instead of clobbering them.
pub fn sync_requests(
    durable: &FullCustomer,
    cached: &FullCustomer,
    features: &[Feature],
) -> Vec<DeductionRequest> {
    let feature_ids: HashSet<&str> = cached
        .entitlements
        .values()
        .chain(durable.entitlements.values())
        .map(|ce| ce.feature_id())
        .collect();

    let mut requests = Vec::new();
    for feature_id in feature_ids {
        if !features.iter().any(|f| f.id == feature_id) {
            continue;
        }
        let effective = |cus: &FullCustomer| {
            cus.entitlements_for_features(&[feature_id])
                .iter()
                .filter(|ce| !ce.unlimited)
                .map(|ce| ce.effective_balance(None))
                .sum::<rust_decimal::Decimal>()
        };
        let target = effective(cached);
        if target != effective(durable) {
            requests.push(DeductionRequest::set_balance(feature_id, target));
        }
    }
    requests
}

#[derive(Clone)]
pub struct RedisCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BillingError::Cache(e.to_string()))?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn customer_key(customer_id: &str) -> String {
        format!("autumn:cus:{customer_id}")
    }

    fn lock_key(customer_id: &str) -> String {
        format!("autumn:lock:{customer_id}")
    }

    /// Customers with a live cached aggregate, for the worker's sync sweep
    pub async fn cached_customer_ids(&self) -> BillingResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut ids = Vec::new();
        let mut keys: redis::AsyncIter<'_, String> = conn.scan_match("autumn:cus:*").await?;
        while let Some(key) = keys.next_item().await {
            if let Some(id) = key.strip_prefix("autumn:cus:") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl EntitlementCache for RedisCache {
    async fn get_customer(&self, customer_id: &str) -> BillingResult<Option<FullCustomer>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(Self::customer_key(customer_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn set_customer(&self, full_cus: &FullCustomer) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(full_cus)?;
        let _: () = conn
            .set_ex(
                Self::customer_key(&full_cus.customer.id),
                json,
                CUSTOMER_TTL.as_secs(),
            )
            .await?;
        Ok(())
    }

    async fn invalidate(&self, customer_id: &str) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::customer_key(customer_id)).await?;
        Ok(())
    }

    async fn lock_customer(&self, customer_id: &str) -> BillingResult<CustomerLock> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();

        let acquired: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(Self::lock_key(customer_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(LOCK_TTL.as_millis() as u64)
            .query_async(&mut conn)
            .await;

        match acquired {
            Ok(Some(_)) => Ok(CustomerLock::Acquired {
                customer_id: customer_id.to_string(),
                token,
            }),
            Ok(None) => Err(BillingError::OperationInProgress {
                customer_id: customer_id.to_string(),
            }),
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "lock backend unavailable, proceeding without customer lock"
                );
                Ok(CustomerLock::Unavailable)
            }
        }
    }

    async fn unlock_customer(&self, lock: CustomerLock) {
        let CustomerLock::Acquired { customer_id, token } = lock else {
            return;
        };
        let mut conn = self.conn.clone();
        // Delete only if we still hold it; an expired lock may have been
        // re-acquired by another operation
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
            "#,
        );
        let result: Result<i64, redis::RedisError> = script
            .key(Self::lock_key(&customer_id))
            .arg(&token)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = result {
            tracing::warn!(customer_id = %customer_id, error = %e, "failed to release customer lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autumn_shared::{
        Allowance, Customer, CustomerEntitlement, Entitlement, FeatureType, IntervalConfig,
        ResetInterval,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn feature(id: &str) -> Feature {
        Feature {
            id: id.to_string(),
            name: id.to_string(),
            feature_type: FeatureType::Metered,
            credit_schema: vec![],
        }
    }

    fn cus_with_balance(balance: Decimal) -> FullCustomer {
        let ce = CustomerEntitlement {
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
            version: 1,
        };
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

    #[test]
    fn test_sync_emits_target_balance_for_diverged_feature() {
        let durable = cus_with_balance(dec!(100));
        let cached = cus_with_balance(dec!(72));
        let features = [feature("messages")];

        let requests = sync_requests(&durable, &cached, &features);

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].feature_id, "messages");
        assert_eq!(
            requests[0].mode,
            crate::deduction::DeductionMode::TargetBalance(dec!(72))
        );
    }

    #[test]
    fn test_sync_is_empty_when_converged() {
        let durable = cus_with_balance(dec!(50));
        let cached = cus_with_balance(dec!(50));
        let features = [feature("messages")];
        assert!(sync_requests(&durable, &cached, &features).is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires redis
    async fn test_lock_excludes_second_holder() {
        let url = std::env::var("REDIS_URL").expect("REDIS_URL required");
        let cache = RedisCache::connect(&url).await.unwrap();

        let lock = cache.lock_customer("cus_lock_test").await.unwrap();
        assert!(matches!(lock, CustomerLock::Acquired { .. }));

        let err = cache.lock_customer("cus_lock_test").await.unwrap_err();
        assert!(matches!(err, BillingError::OperationInProgress { .. }));

        cache.unlock_customer(lock).await;
        let relock = cache.lock_customer("cus_lock_test").await.unwrap();
        cache.unlock_customer(relock).await;
    }
}
