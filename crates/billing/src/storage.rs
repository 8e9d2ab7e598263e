//! Durable storage
//!
//! The [`Storage`] trait is the only way the core touches the database, so
//! tests can substitute an in-memory implementation and the deduction engine
//! stays storage-agnostic. [`PgStorage`] is the Postgres implementation;
//! nested configuration (product, entitlement template, buckets, rollovers)
//! is stored as JSONB, scalar state as columns.

use async_trait::async_trait;
use autumn_shared::{
    CusProductStatus, Customer, CustomerEntitlement, CustomerProduct, Feature, FullCustomer,
    Product, Replaceable, Rollover,
};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use uuid::Uuid;

use crate::deduction::EntitlementUpdate;
use crate::error::{BillingError, BillingResult};
use crate::plan::CustomerProductUpdate;

/// Result of claiming a rollover period. Exactly one concurrent reset wins;
/// the loser re-reads the winner's entitlement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverClaim {
    Won,
    Lost,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn full_customer(&self, customer_id: &str) -> BillingResult<FullCustomer>;

    async fn insert_customer(&self, customer: &Customer) -> BillingResult<()>;
    async fn set_provider_customer_id(
        &self,
        customer_id: &str,
        provider_customer_id: &str,
    ) -> BillingResult<()>;

    async fn insert_customer_product(&self, cus_product: &CustomerProduct) -> BillingResult<()>;
    async fn update_customer_product(&self, update: &CustomerProductUpdate) -> BillingResult<()>;
    /// Expire many products in one transaction, archiving their
    /// entitlements alongside
    async fn expire_customer_products(&self, ids: &[Uuid], now_ms: i64) -> BillingResult<()>;

    async fn insert_entitlement(&self, ce: &CustomerEntitlement) -> BillingResult<()>;
    /// Conditional write: applies only when the stored version matches.
    /// Returns false on a version conflict so the caller can re-read.
    async fn update_entitlement(
        &self,
        id: Uuid,
        expected_version: i64,
        update: &EntitlementUpdate,
    ) -> BillingResult<bool>;
    /// Full-state write for resets; same version contract
    async fn replace_entitlement(&self, ce: &CustomerEntitlement) -> BillingResult<bool>;

    /// Claim the (entitlement, period) rollover slot. At most one caller
    /// wins per period; the unique key arbitrates the race.
    async fn claim_rollover_period(
        &self,
        entitlement_id: Uuid,
        period_ms: i64,
        rollover: &Rollover,
    ) -> BillingResult<RolloverClaim>;

    async fn insert_replaceables(
        &self,
        grants: &[(Uuid, Replaceable)],
    ) -> BillingResult<()>;
    async fn delete_replaceables(&self, ids: &[Uuid]) -> BillingResult<()>;
    /// Release grants flagged `delete_next_cycle`, on invoice-created
    async fn release_deferred_replaceables(&self, customer_id: &str) -> BillingResult<u64>;

    /// Whether this fingerprint has already consumed a unique trial
    async fn trial_fingerprint_used(&self, fingerprint: &str) -> BillingResult<bool>;

    /// Idempotency: returns true the first time a key is seen
    async fn record_idempotency_key(&self, key: &str, intent: &str) -> BillingResult<bool>;

    /// Entitlements whose reset is due, for the worker's reset sweep
    async fn due_entitlements(&self, now_ms: i64, limit: i64)
        -> BillingResult<Vec<CustomerEntitlement>>;

    /// Feature catalog
    async fn features(&self) -> BillingResult<Vec<Feature>>;
    /// Product catalog
    async fn products(&self) -> BillingResult<Vec<Product>>;
}

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> BillingResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> BillingResult<T> {
    Ok(serde_json::from_value(value)?)
}

fn row_to_customer_product(row: &sqlx::postgres::PgRow) -> BillingResult<CustomerProduct> {
    let quantity: i64 = row.try_get("quantity")?;
    Ok(CustomerProduct {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        product: from_json(row.try_get("product")?)?,
        entity_id: row.try_get("entity_id")?,
        status: row.try_get("status")?,
        starts_at: row.try_get("starts_at")?,
        trial_ends_at: row.try_get("trial_ends_at")?,
        canceled_at: row.try_get("canceled_at")?,
        ended_at: row.try_get("ended_at")?,
        subscription_ids: from_json(row.try_get("subscription_ids")?)?,
        schedule_ids: from_json(row.try_get("schedule_ids")?)?,
        quantity: u32::try_from(quantity)
            .map_err(|_| BillingError::Internal("negative product quantity".to_string()))?,
        options: from_json(row.try_get("options")?)?,
    })
}

fn row_to_entitlement(row: &sqlx::postgres::PgRow) -> BillingResult<CustomerEntitlement> {
    Ok(CustomerEntitlement {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        customer_product_id: row.try_get("customer_product_id")?,
        entitlement: from_json(row.try_get("entitlement")?)?,
        balance: row.try_get("balance")?,
        additional_balance: row.try_get("additional_balance")?,
        adjustment: row.try_get("adjustment")?,
        entities: from_json(row.try_get("entities")?)?,
        usage_allowed: row.try_get("usage_allowed")?,
        unlimited: row.try_get("unlimited")?,
        next_reset_at: row.try_get("next_reset_at")?,
        rollovers: from_json(row.try_get("rollovers")?)?,
        replaceables: from_json(row.try_get("replaceables")?)?,
        archived: row.try_get("archived")?,
        version: row.try_get("version")?,
    })
}

#[async_trait]
impl Storage for PgStorage {
    async fn full_customer(&self, customer_id: &str) -> BillingResult<FullCustomer> {
        let customer_row: Option<(String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT id, fingerprint, provider_customer_id FROM customers WHERE id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((id, fingerprint, provider_customer_id)) = customer_row else {
            return Err(BillingError::CustomerNotFound(customer_id.to_string()));
        };

        let product_rows = sqlx::query(
            r#"
            SELECT id, customer_id, product, entity_id, status, starts_at,
                   trial_ends_at, canceled_at, ended_at, subscription_ids,
                   schedule_ids, quantity, options
            FROM customer_products
            WHERE customer_id = $1 AND status != 'expired'
            ORDER BY starts_at
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        let entitlement_rows = sqlx::query(
            r#"
            SELECT id, customer_id, customer_product_id, entitlement, balance,
                   additional_balance, adjustment, entities, usage_allowed,
                   unlimited, next_reset_at, rollovers, replaceables, archived,
                   version
            FROM customer_entitlements
            WHERE customer_id = $1 AND archived = false
            "#,
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        let customer_products = product_rows
            .iter()
            .map(row_to_customer_product)
            .collect::<BillingResult<Vec<_>>>()?;
        let entitlements = entitlement_rows
            .iter()
            .map(row_to_entitlement)
            .map(|ce| ce.map(|ce| (ce.id, ce)))
            .collect::<BillingResult<HashMap<_, _>>>()?;

        Ok(FullCustomer {
            customer: Customer {
                id,
                fingerprint,
                provider_customer_id,
            },
            customer_products,
            entitlements,
        })
    }

    async fn insert_customer(&self, customer: &Customer) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customers (id, fingerprint, provider_customer_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&customer.id)
        .bind(&customer.fingerprint)
        .bind(&customer.provider_customer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_provider_customer_id(
        &self,
        customer_id: &str,
        provider_customer_id: &str,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE customers SET provider_customer_id = $1 WHERE id = $2")
            .bind(provider_customer_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_customer_product(&self, cus_product: &CustomerProduct) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_products (
                id, customer_id, product, entity_id, status, starts_at,
                trial_ends_at, canceled_at, ended_at, subscription_ids,
                schedule_ids, quantity, options
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(cus_product.id)
        .bind(&cus_product.customer_id)
        .bind(to_json(&cus_product.product)?)
        .bind(&cus_product.entity_id)
        .bind(cus_product.status)
        .bind(cus_product.starts_at)
        .bind(cus_product.trial_ends_at)
        .bind(cus_product.canceled_at)
        .bind(cus_product.ended_at)
        .bind(to_json(&cus_product.subscription_ids)?)
        .bind(to_json(&cus_product.schedule_ids)?)
        .bind(i64::from(cus_product.quantity))
        .bind(to_json(&cus_product.options)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_customer_product(&self, update: &CustomerProductUpdate) -> BillingResult<()> {
        // Partial update: COALESCE-style per optional field, JSONB fields
        // written only when present
        sqlx::query(
            r#"
            UPDATE customer_products SET
                status = COALESCE($2, status),
                canceled_at = CASE WHEN $3 THEN $4 ELSE canceled_at END,
                ended_at = CASE WHEN $5 THEN $6 ELSE ended_at END,
                trial_ends_at = CASE WHEN $7 THEN $8 ELSE trial_ends_at END,
                options = COALESCE($9, options),
                quantity = COALESCE($10, quantity),
                subscription_ids = COALESCE($11, subscription_ids),
                schedule_ids = COALESCE($12, schedule_ids)
            WHERE id = $1
            "#,
        )
        .bind(update.id)
        .bind(update.status)
        .bind(update.canceled_at.is_some())
        .bind(update.canceled_at.flatten())
        .bind(update.ended_at.is_some())
        .bind(update.ended_at.flatten())
        .bind(update.trial_ends_at.is_some())
        .bind(update.trial_ends_at.flatten())
        .bind(match &update.options {
            Some(options) => Some(to_json(options)?),
            None => None,
        })
        .bind(update.quantity.map(i64::from))
        .bind(match &update.subscription_ids {
            Some(ids) => Some(to_json(ids)?),
            None => None,
        })
        .bind(match &update.schedule_ids {
            Some(ids) => Some(to_json(ids)?),
            None => None,
        })
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn expire_customer_products(&self, ids: &[Uuid], now_ms: i64) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE customer_products
            SET status = $1, ended_at = $2
            WHERE id = ANY($3)
            "#,
        )
        .bind(CusProductStatus::Expired)
        .bind(now_ms)
        .bind(ids)
        .execute(&mut *tx)
        .await?;
        // Loose entitlements have no product and are never archived here
        sqlx::query(
            "UPDATE customer_entitlements SET archived = true WHERE customer_product_id = ANY($1)",
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_entitlement(&self, ce: &CustomerEntitlement) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO customer_entitlements (
                id, customer_id, customer_product_id, entitlement, balance,
                additional_balance, adjustment, entities, usage_allowed,
                unlimited, next_reset_at, rollovers, replaceables, archived,
                version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(ce.id)
        .bind(&ce.customer_id)
        .bind(ce.customer_product_id)
        .bind(to_json(&ce.entitlement)?)
        .bind(ce.balance)
        .bind(ce.additional_balance)
        .bind(ce.adjustment)
        .bind(to_json(&ce.entities)?)
        .bind(ce.usage_allowed)
        .bind(ce.unlimited)
        .bind(ce.next_reset_at)
        .bind(to_json(&ce.rollovers)?)
        .bind(to_json(&ce.replaceables)?)
        .bind(ce.archived)
        .bind(ce.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_entitlement(
        &self,
        id: Uuid,
        expected_version: i64,
        update: &EntitlementUpdate,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE customer_entitlements SET
                balance = $3,
                additional_balance = $4,
                adjustment = $5,
                entities = $6,
                rollovers = $7,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(update.balance)
        .bind(update.additional_balance)
        .bind(update.adjustment)
        .bind(to_json(&update.entities)?)
        .bind(to_json(&update.rollovers)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_entitlement(&self, ce: &CustomerEntitlement) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE customer_entitlements SET
                balance = $3,
                additional_balance = $4,
                adjustment = $5,
                entities = $6,
                next_reset_at = $7,
                rollovers = $8,
                replaceables = $9,
                version = version + 1
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(ce.id)
        .bind(ce.version)
        .bind(ce.balance)
        .bind(ce.additional_balance)
        .bind(ce.adjustment)
        .bind(to_json(&ce.entities)?)
        .bind(ce.next_reset_at)
        .bind(to_json(&ce.rollovers)?)
        .bind(to_json(&ce.replaceables)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_rollover_period(
        &self,
        entitlement_id: Uuid,
        period_ms: i64,
        rollover: &Rollover,
    ) -> BillingResult<RolloverClaim> {
        let result = sqlx::query(
            r#"
            INSERT INTO rollover_periods (customer_entitlement_id, period_ms, rollover)
            VALUES ($1, $2, $3)
            ON CONFLICT (customer_entitlement_id, period_ms) DO NOTHING
            "#,
        )
        .bind(entitlement_id)
        .bind(period_ms)
        .bind(to_json(rollover)?)
        .execute(&self.pool)
        .await?;
        Ok(if result.rows_affected() == 1 {
            RolloverClaim::Won
        } else {
            RolloverClaim::Lost
        })
    }

    async fn insert_replaceables(
        &self,
        grants: &[(Uuid, Replaceable)],
    ) -> BillingResult<()> {
        for (entitlement_id, grant) in grants {
            sqlx::query(
                r#"
                UPDATE customer_entitlements
                SET replaceables = replaceables || $2::jsonb
                WHERE id = $1
                "#,
            )
            .bind(entitlement_id)
            .bind(to_json(grant)?)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn delete_replaceables(&self, ids: &[Uuid]) -> BillingResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        sqlx::query(
            r#"
            UPDATE customer_entitlements
            SET replaceables = (
                SELECT COALESCE(jsonb_agg(r), '[]'::jsonb)
                FROM jsonb_array_elements(replaceables) r
                WHERE NOT (r->>'id' = ANY($1))
            )
            WHERE replaceables @> ANY(
                SELECT jsonb_build_array(jsonb_build_object('id', x))
                FROM unnest($1::text[]) x
            )
            "#,
        )
        .bind(&id_strings)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_deferred_replaceables(&self, customer_id: &str) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE customer_entitlements
            SET replaceables = (
                SELECT COALESCE(jsonb_agg(r), '[]'::jsonb)
                FROM jsonb_array_elements(replaceables) r
                WHERE (r->>'delete_next_cycle')::boolean = false
            )
            WHERE customer_id = $1
              AND replaceables @> '[{"delete_next_cycle": true}]'::jsonb
            "#,
        )
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn trial_fingerprint_used(&self, fingerprint: &str) -> BillingResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM customer_products cp
            JOIN customers c ON c.id = cp.customer_id
            WHERE c.fingerprint = $1 AND cp.trial_ends_at IS NOT NULL
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(count,)| count > 0).unwrap_or(false))
    }

    async fn record_idempotency_key(&self, key: &str, intent: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_idempotency (key, intent, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(intent)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn due_entitlements(
        &self,
        now_ms: i64,
        limit: i64,
    ) -> BillingResult<Vec<CustomerEntitlement>> {
        let rows = sqlx::query(
            r#"
            SELECT id, customer_id, customer_product_id, entitlement, balance,
                   additional_balance, adjustment, entities, usage_allowed,
                   unlimited, next_reset_at, rollovers, replaceables, archived,
                   version
            FROM customer_entitlements
            WHERE archived = false
              AND next_reset_at IS NOT NULL
              AND next_reset_at <= $1
            ORDER BY next_reset_at
            LIMIT $2
            "#,
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_entitlement).collect()
    }

    async fn features(&self) -> BillingResult<Vec<Feature>> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT data FROM features ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(|(data,)| from_json(data)).collect()
    }

    async fn products(&self) -> BillingResult<Vec<Product>> {
        let rows: Vec<(serde_json::Value,)> =
            sqlx::query_as("SELECT data FROM products ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(|(data,)| from_json(data)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autumn_shared::db::create_pool;

    async fn storage() -> PgStorage {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = create_pool(&url).await.expect("Failed to create pool");
        PgStorage::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_missing_customer_is_not_found() {
        let storage = storage().await;
        let err = storage.full_customer("cus_missing").await.unwrap_err();
        assert!(matches!(err, BillingError::CustomerNotFound(_)));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_rollover_period_claimed_once() {
        let storage = storage().await;
        let entitlement_id = Uuid::new_v4();
        let rollover = Rollover {
            id: Uuid::new_v4(),
            amount: rust_decimal::Decimal::from(10),
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
        assert_eq!(first, RolloverClaim::Won);
        assert_eq!(second, RolloverClaim::Lost);
    }
}
