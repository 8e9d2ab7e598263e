//! Webhook queue processor
//!
//! Drains provider events from the persistent queue with retry bookkeeping.
//! The API layer enqueues verified webhook payloads (already resolved to a
//! customer id); this worker converges local state against the provider
//! snapshot, so a missed or reordered event is corrected by the next one.

use autumn_billing::cache::EntitlementCache;
use autumn_billing::provider::{ProviderInvoice, ProviderSubscription};
use autumn_billing::reconcile;
use autumn_billing::storage::Storage;
use autumn_billing::BillingContext;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Process pending webhooks from the queue
pub async fn process_webhook_queue(pool: &PgPool, ctx: &BillingContext) {
    // Pending events, plus failed ones with retries remaining after backoff.
    // Claiming in the same statement as the locked select keeps concurrent
    // workers off the same batch; `attempts` comes back post-increment.
    let webhooks: Vec<(Uuid, String, String, Value, i32, i32)> = match sqlx::query_as(
        r#"
        UPDATE webhook_processing_queue
        SET status = 'processing', last_attempt_at = NOW(), attempts = attempts + 1
        WHERE id IN (
            SELECT id
            FROM webhook_processing_queue
            WHERE (status = 'pending' OR (status = 'failed' AND attempts < max_attempts))
              AND (last_attempt_at IS NULL OR last_attempt_at < NOW() - INTERVAL '5 minutes')
            ORDER BY created_at ASC
            LIMIT 10
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, customer_id, event_type, payload, attempts, max_attempts
        "#,
    )
    .fetch_all(pool)
    .await
    {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "Failed to fetch webhooks from queue");
            return;
        }
    };

    if webhooks.is_empty() {
        return;
    }

    info!(count = webhooks.len(), "Processing webhooks from queue");

    for (queue_id, customer_id, event_type, payload, attempts, max_attempts) in webhooks {
        let result = dispatch_event(ctx, &customer_id, &event_type, &payload).await;

        match result {
            Ok(()) => {
                if let Err(e) = sqlx::query(
                    "UPDATE webhook_processing_queue SET status = 'completed', processed_at = NOW() WHERE id = $1"
                )
                .bind(queue_id)
                .execute(pool)
                .await
                {
                    error!(queue_id = %queue_id, error = %e, "Failed to mark webhook as completed");
                }
                info!(queue_id = %queue_id, event_type = %event_type, "Webhook processed");
            }
            Err(e) => {
                let error_msg = e.to_string();

                if let Err(e) = sqlx::query(
                    "UPDATE webhook_processing_queue SET status = 'failed', last_error = $1 WHERE id = $2"
                )
                .bind(&error_msg)
                .bind(queue_id)
                .execute(pool)
                .await
                {
                    error!(queue_id = %queue_id, error = %e, "Failed to mark webhook as failed");
                }

                if attempts >= max_attempts {
                    error!(
                        queue_id = %queue_id,
                        event_type = %event_type,
                        attempts = attempts,
                        error = %error_msg,
                        "Webhook permanently failed after max retries"
                    );
                } else {
                    warn!(
                        queue_id = %queue_id,
                        event_type = %event_type,
                        attempts = attempts,
                        max_attempts = max_attempts,
                        error = %error_msg,
                        "Webhook processing failed, will retry"
                    );
                }
            }
        }
    }
}

/// Converge local customer state against the provider snapshot carried by
/// one event. Unknown event types complete without retrying.
async fn dispatch_event(
    ctx: &BillingContext,
    customer_id: &str,
    event_type: &str,
    payload: &Value,
) -> anyhow::Result<()> {
    match event_type {
        "subscription.updated" | "subscription.deleted" => {
            let sub: ProviderSubscription = serde_json::from_value(payload.clone())?;
            let full_cus = ctx.storage.full_customer(customer_id).await?;
            let convergence = reconcile::converge_subscription(&full_cus, &sub);
            if !convergence.is_empty() {
                let now = autumn_billing::intervals::now_ms();
                reconcile::apply_convergence(ctx.storage.as_ref(), &convergence, now).await?;
                if let Err(e) = ctx.cache.invalidate(customer_id).await {
                    warn!(customer_id = %customer_id, error = %e, "cache invalidation failed");
                }
            }
            Ok(())
        }
        "invoice.created" => {
            reconcile::handle_invoice_created(ctx.storage.as_ref(), customer_id).await?;
            Ok(())
        }
        "invoice.paid" | "invoice.payment_failed" | "invoice.marked_uncollectible"
        | "invoice.voided" => {
            let invoice: ProviderInvoice = serde_json::from_value(payload.clone())?;
            let full_cus = ctx.storage.full_customer(customer_id).await?;
            let convergence = reconcile::converge_invoice(&full_cus, &invoice);
            if !convergence.is_empty() {
                let now = autumn_billing::intervals::now_ms();
                reconcile::apply_convergence(ctx.storage.as_ref(), &convergence, now).await?;
                if let Err(e) = ctx.cache.invalidate(customer_id).await {
                    warn!(customer_id = %customer_id, error = %e, "cache invalidation failed");
                }
            }
            Ok(())
        }
        _ => {
            warn!(event_type = %event_type, "Unknown webhook event type");
            Ok(())
        }
    }
}

/// Cleanup old completed/failed webhooks (for maintenance job)
pub async fn cleanup_old_webhooks(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM webhook_processing_queue
        WHERE processed_at < NOW() - ($1 || ' days')::INTERVAL
          AND status IN ('completed', 'failed')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days = retention_days,
                    "Cleaned up old webhook queue entries"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to cleanup old webhooks");
        }
    }
}
