//! Lifecycle sweeper
//!
//! Demotes records whose paid or trial term has run out, and sends the
//! expiry warning a few days before a term ends. Entitlement reads already
//! demote lapsed records inline; the sweeper covers accounts nobody is
//! looking at so their status and notifications stay accurate.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::notify::{NotificationTemplate, Notifier};
use crate::plans::PlanCatalog;
use crate::store::BillingStore;
use crate::subscriptions::{Change, SubscriptionService};

/// Days before the end of a term that the warning goes out
pub const EXPIRY_WARNING_DAYS: i64 = 3;

/// Records examined per sweep
pub const DEFAULT_SWEEP_BATCH: i64 = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Renewed or changed by someone else between the scan and the write
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarningReport {
    pub scanned: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct LifecycleSweeper {
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionService,
    notifier: Arc<dyn Notifier>,
    events: BillingEventLogger,
}

impl LifecycleSweeper {
    pub fn new(
        store: Arc<dyn BillingStore>,
        subscriptions: SubscriptionService,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            events: BillingEventLogger::new(Arc::clone(&store)),
            store,
            subscriptions,
            notifier,
        }
    }

    /// Expire up to `batch` lapsed records
    pub async fn sweep_expired(&self, now: OffsetDateTime, batch: i64) -> BillingResult<SweepReport> {
        let due = self.store.list_past_due(now, batch).await?;
        let mut report = SweepReport {
            scanned: due.len(),
            ..Default::default()
        };

        for sub in due {
            match self.subscriptions.expire_if_past_due(sub.user_id, now).await {
                Ok(Change::Applied { .. }) => report.expired += 1,
                Ok(Change::Unchanged { .. }) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(user_id = %sub.user_id, error = %e, "Failed to expire subscription");
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "Expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Warn records whose term ends within `window`; once per term, and only
    /// for plans that run longer than the window
    pub async fn send_expiry_warnings(&self, now: OffsetDateTime, window: Duration) -> BillingResult<WarningReport> {
        let expiring = self
            .store
            .list_expiring(now, now + window, DEFAULT_SWEEP_BATCH)
            .await?;
        let mut report = WarningReport {
            scanned: expiring.len(),
            ..Default::default()
        };

        for sub in expiring {
            // A term no longer than the window is "expiring soon" from the
            // moment it starts, so a Day Pass gets no warning. It is still
            // flagged so it drops out of later scans.
            if PlanCatalog::duration(sub.plan).is_some_and(|term| term <= window) {
                if let Err(e) = self.subscriptions.mark_expiry_warned(sub.user_id, now).await {
                    tracing::warn!(user_id = %sub.user_id, error = %e, "Failed to flag short term as warned");
                }
                report.skipped += 1;
                continue;
            }

            // Flag first so a crash between the two can only lose a warning, never repeat one
            match self.subscriptions.mark_expiry_warned(sub.user_id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(user_id = %sub.user_id, error = %e, "Failed to flag expiry warning");
                    continue;
                }
            }

            let data = json!({
                "plan": sub.plan,
                "status": sub.status,
                "days_remaining": sub.days_remaining(now),
                "end_date": sub.end_date.map(|d| d.unix_timestamp()),
                "auto_renew": sub.auto_renew,
            });
            self.notifier
                .notify(sub.user_id, NotificationTemplate::ExpiryWarning, data.clone())
                .await;
            self.events
                .log_or_warn(BillingEventBuilder::new(Some(sub.user_id), BillingEventType::ExpiryWarningSent).data(data))
                .await;
            report.sent += 1;
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                sent = report.sent,
                skipped = report.skipped,
                failed = report.failed,
                "Expiry warnings sent"
            );
        }
        Ok(report)
    }
}
