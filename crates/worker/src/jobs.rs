//! Scheduled billing jobs
//!
//! Each job logs its own outcome and never returns an error to the
//! scheduler; a failed run is retried on the next tick.

use fixitflow_billing::{sweeper::DEFAULT_SWEEP_BATCH, BillingService, EXPIRY_WARNING_DAYS};
use time::{Duration, OffsetDateTime};
use tracing::{error, info};

/// Webhook audit rows older than this are deleted
pub const WEBHOOK_RETENTION_DAYS: i64 = 90;

/// Demote every subscription whose term has lapsed, in batches, until a
/// batch comes back short
pub async fn sweep_expired(billing: &BillingService, now: OffsetDateTime) -> usize {
    let mut expired = 0;
    loop {
        match billing.sweeper.sweep_expired(now, DEFAULT_SWEEP_BATCH).await {
            Ok(report) => {
                expired += report.expired;
                // Nothing demoted means the rest are failures or races; leave them for the next tick
                if report.scanned < DEFAULT_SWEEP_BATCH as usize || report.expired == 0 {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Expiry sweep failed");
                break;
            }
        }
    }
    info!(expired = expired, "Expiry sweep complete");
    expired
}

pub async fn send_expiry_warnings(billing: &BillingService, now: OffsetDateTime) -> usize {
    match billing
        .sweeper
        .send_expiry_warnings(now, Duration::days(EXPIRY_WARNING_DAYS))
        .await
    {
        Ok(report) => {
            info!(
                scanned = report.scanned,
                sent = report.sent,
                skipped = report.skipped,
                failed = report.failed,
                "Expiry warning run complete"
            );
            report.sent
        }
        Err(e) => {
            error!(error = %e, "Expiry warning run failed");
            0
        }
    }
}

pub async fn cleanup_webhook_events(billing: &BillingService) -> u64 {
    match billing.webhooks.cleanup_older_than(WEBHOOK_RETENTION_DAYS).await {
        Ok(deleted) => {
            info!(deleted = deleted, retention_days = WEBHOOK_RETENTION_DAYS, "Webhook retention cleanup complete");
            deleted
        }
        Err(e) => {
            error!(error = %e, "Webhook retention cleanup failed");
            0
        }
    }
}
