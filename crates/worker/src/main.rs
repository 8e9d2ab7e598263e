//! Background worker
//!
//! Runs the jobs the request path defers: draining the provider webhook
//! queue, sweeping due entitlement resets, flushing cached balances to the
//! durable store, and queue maintenance.

mod resets;
mod sync;
mod webhook_processor;

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use autumn_billing::cache::RedisCache;
use autumn_billing::context::BillingConfig;
use autumn_billing::storage::{PgStorage, Storage};
use autumn_billing::stripe_provider::StripeProvider;
use autumn_billing::{BillingContext, BillingService};

const WEBHOOK_RETENTION_DAYS: i32 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("autumn_worker=info".parse()?)
                .add_directive("autumn_billing=info".parse()?),
        )
        .json()
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let redis_url = std::env::var("REDIS_URL").context("REDIS_URL must be set")?;

    let migration_pool = autumn_shared::db::create_migration_pool(&database_url).await?;
    sqlx::migrate!("../../migrations").run(&migration_pool).await?;
    migration_pool.close().await;

    let pool = autumn_shared::db::create_pool(&database_url).await?;
    let cache = RedisCache::connect(&redis_url).await?;
    let storage = Arc::new(PgStorage::new(pool.clone()));
    let provider = Arc::new(StripeProvider::from_env()?);
    let config = BillingConfig::from_env()?;

    let features = storage.features().await?;
    let products = storage.products().await?;
    info!(
        features = features.len(),
        products = products.len(),
        "Loaded billing catalogs"
    );

    let ctx = BillingContext::new(
        storage,
        Arc::new(cache.clone()),
        provider,
        features,
        products,
        config,
    );
    let service = Arc::new(BillingService::new(ctx.clone()));

    let sched = JobScheduler::new().await?;

    // Webhook queue drain, every 10 seconds
    {
        let pool = pool.clone();
        let ctx = ctx.clone();
        sched
            .add(Job::new_async("1/10 * * * * *", move |_id, _sched| {
                let pool = pool.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    webhook_processor::process_webhook_queue(&pool, &ctx).await;
                })
            })?)
            .await?;
    }

    // Entitlement reset sweep, every minute
    {
        let ctx = ctx.clone();
        sched
            .add(Job::new_async("0 * * * * *", move |_id, _sched| {
                let ctx = ctx.clone();
                Box::pin(async move {
                    resets::run_reset_sweep(&ctx).await;
                })
            })?)
            .await?;
    }

    // Cache-to-durable sync sweep, every 5 minutes
    {
        let service = service.clone();
        let cache = cache.clone();
        sched
            .add(Job::new_async("0 */5 * * * *", move |_id, _sched| {
                let service = service.clone();
                let cache = cache.clone();
                Box::pin(async move {
                    sync::run_sync_sweep(&service, &cache).await;
                })
            })?)
            .await?;
    }

    // Queue maintenance, hourly
    {
        let pool = pool.clone();
        sched
            .add(Job::new_async("0 0 * * * *", move |_id, _sched| {
                let pool = pool.clone();
                Box::pin(async move {
                    webhook_processor::cleanup_old_webhooks(&pool, WEBHOOK_RETENTION_DAYS).await;
                })
            })?)
            .await?;
    }

    sched.start().await?;
    info!("Worker started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
