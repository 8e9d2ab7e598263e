//! Cache-to-durable sync sweep
//!
//! Walks the customers with a live cached aggregate and feeds any diverged
//! balances back into the durable store through the target-balance path, so
//! cache-served deductions survive a cache eviction.

use autumn_billing::cache::RedisCache;
use autumn_billing::{BillingError, BillingService};
use tracing::{error, info, warn};

/// Run one sync pass. Returns the number of customers that needed writes.
pub async fn run_sync_sweep(service: &BillingService, cache: &RedisCache) -> usize {
    let customer_ids = match cache.cached_customer_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "Failed to scan cached customers");
            return 0;
        }
    };

    let mut synced = 0;
    for customer_id in customer_ids {
        match service.sync_customer(&customer_id).await {
            Ok(0) => {}
            Ok(_) => synced += 1,
            // Another operation holds the lock; its write path syncs for us
            Err(BillingError::OperationInProgress { .. }) => {}
            Err(e) => {
                warn!(customer_id = %customer_id, error = %e, "Customer sync failed");
            }
        }
    }
    if synced > 0 {
        info!(count = synced, "Synced cached balances to durable store");
    }
    synced
}
