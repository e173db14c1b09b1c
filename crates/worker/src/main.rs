//! FixItFlow Background Worker
//!
//! Handles scheduled billing jobs:
//! - Expiry sweep of lapsed subscriptions and trials (every 15 minutes)
//! - "Expiring soon" warnings, once per term (hourly)
//! - Webhook audit retention cleanup (daily at 3:00 AM UTC)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use fixitflow_billing::{BillingService, MemoryUsageStore, RedisUsageStore, UsageStore};
use fixitflow_shared::{create_pool, run_migrations};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

fn billing_enabled() -> bool {
    std::env::var("ENABLE_BILLING")
        .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off"))
        .unwrap_or(true)
}

async fn usage_store() -> Arc<dyn UsageStore> {
    match std::env::var("REDIS_URL") {
        Ok(url) => match RedisUsageStore::connect(&url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "Redis unavailable; using in-memory usage counters");
                Arc::new(MemoryUsageStore::new())
            }
        },
        Err(_) => Arc::new(MemoryUsageStore::new()),
    }
}

async fn heartbeat() {
    loop {
        tokio::time::sleep(Duration::from_secs(60)).await;
        info!("Worker heartbeat (minimal mode)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fixitflow_billing=debug")),
        )
        .init();

    info!("Starting FixItFlow Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5);
    let pool = create_pool(&database_url, max_connections).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    if !billing_enabled() {
        info!("Billing disabled; worker running in minimal mode");
        heartbeat().await;
        return Ok(());
    }

    let secret = std::env::var("TOKEN_SIGNING_SECRET").unwrap_or_default();
    let billing = match BillingService::from_env(pool, usage_store().await, secret.into_bytes()) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            heartbeat().await;
            return Ok(());
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expiry sweep. Reads already expire inline; this keeps stored state honest.
    // Cron: every 15 minutes
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                jobs::sweep_expired(&billing, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Expiry sweep (every 15 minutes)");

    // Job 2: Expiry warnings
    // Cron: at minute 5 past every hour
    let warning_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let billing = warning_billing.clone();
            Box::pin(async move {
                jobs::send_expiry_warnings(&billing, OffsetDateTime::now_utc()).await;
            })
        })?)
        .await?;
    info!("Scheduled: Expiry warnings (hourly)");

    // Job 3: Webhook retention
    // Cron: at 3:00 AM UTC daily
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                jobs::cleanup_webhook_events(&billing).await;
            })
        })?)
        .await?;
    info!(
        "Scheduled: Webhook retention cleanup (daily at 3:00 AM UTC, {} days)",
        jobs::WEBHOOK_RETENTION_DAYS
    );

    // Catch up on anything that lapsed while the worker was down
    jobs::sweep_expired(&billing, OffsetDateTime::now_utc()).await;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("FixItFlow Worker started successfully with 3 scheduled jobs");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    Ok(())
}
