//! Webhook reconciliation
//!
//! Applies authenticated provider events to subscription records exactly
//! once. Each delivery is claimed by `(provider, event_id)` before anything
//! is applied; a delivery that is already done or in flight is acknowledged
//! as a duplicate. Deliveries that fail stay re-claimable so the provider's
//! retry (or a manual replay) can finish them.

use std::sync::Arc;

use fixitflow_shared::{ProviderKind, UserId};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::providers::{
    GrantOutcome, ProviderEvent, ProviderEventKind, ProviderRegistry, Purchase, RemoteStatus,
    SignatureHeaders,
};
use crate::store::{BillingStore, WebhookClaim, WebhookEventRecord, WebhookProcessingResult};
use crate::subscription::Subscription;
use crate::subscriptions::{Change, Origin, SubscriptionService};

/// What happened to a delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Applied,
    /// Same event already processed or being processed
    Duplicate,
    /// Authentic, but nothing to change
    Ignored { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookOutcome {
    pub provider: ProviderKind,
    pub event_id: String,
    pub event_type: String,
    #[serde(flatten)]
    pub disposition: Disposition,
}

/// Result of replaying a stored delivery
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub provider: ProviderKind,
    pub event_id: String,
    pub event_type: String,
    pub previous_status: String,
    pub previous_error: Option<String>,
    pub new_status: String,
    pub new_error: Option<String>,
    pub success: bool,
}

fn ignored(reason: impl Into<String>) -> Disposition {
    Disposition::Ignored {
        reason: reason.into(),
    }
}

impl From<&Change> for Disposition {
    fn from(change: &Change) -> Self {
        match change {
            Change::Applied { .. } => Disposition::Applied,
            Change::Unchanged { reason, .. } => ignored(*reason),
        }
    }
}

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionService,
    providers: Arc<ProviderRegistry>,
    events: BillingEventLogger,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        subscriptions: SubscriptionService,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            events: BillingEventLogger::new(Arc::clone(&store)),
            store,
            subscriptions,
            providers,
        }
    }

    /// Authenticate, claim, and apply one delivery.
    ///
    /// Errors: `InvalidSignature` (reject), `UnknownEvent` (acknowledge, do
    /// not retry), transient errors (provider should retry).
    pub async fn handle(
        &self,
        provider: ProviderKind,
        payload: &str,
        headers: &SignatureHeaders,
    ) -> BillingResult<WebhookOutcome> {
        let adapter = self.providers.get(provider)?;
        let event = adapter.confirm(payload, headers).await.map_err(|e| {
            if matches!(e, BillingError::InvalidSignature) {
                tracing::warn!(provider = %provider, "Rejected webhook with invalid signature");
            }
            e
        })?;

        let claim = WebhookClaim {
            provider,
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            event_timestamp: event.occurred_at,
            payload: serde_json::to_value(&event)?,
        };

        if !self.store.claim_webhook_event(&claim).await? {
            tracing::info!(
                provider = %provider,
                event_id = %event.event_id,
                event_type = %event.event_type,
                reason = "already processed or in progress",
                "Duplicate webhook delivery"
            );
            return Ok(WebhookOutcome {
                provider,
                event_id: event.event_id,
                event_type: event.event_type,
                disposition: Disposition::Duplicate,
            });
        }

        tracing::info!(
            provider = %provider,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Processing webhook event (claimed)"
        );
        self.run_claimed(&event).await
    }

    /// Apply a claimed event and record the result on its delivery row
    async fn run_claimed(&self, event: &ProviderEvent) -> BillingResult<WebhookOutcome> {
        let result = self.apply(event).await;

        let (status, message) = match &result {
            Ok(_) | Err(BillingError::UnknownEvent(_)) => (WebhookProcessingResult::Success, None),
            Err(e) => (WebhookProcessingResult::Error, Some(e.to_string())),
        };
        self.finish(event, status, message.as_deref()).await;

        match &result {
            Ok(disposition) => tracing::info!(
                provider = %event.provider,
                event_id = %event.event_id,
                event_type = %event.event_type,
                disposition = ?disposition,
                "Webhook event processed"
            ),
            Err(BillingError::UnknownEvent(_)) => tracing::info!(
                provider = %event.provider,
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Webhook event type not handled"
            ),
            Err(e) => tracing::error!(
                provider = %event.provider,
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %e,
                "Webhook event failed"
            ),
        }

        result.map(|disposition| WebhookOutcome {
            provider: event.provider,
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            disposition,
        })
    }

    async fn finish(&self, event: &ProviderEvent, status: WebhookProcessingResult, message: Option<&str>) {
        for attempt in 1..=2 {
            match self
                .store
                .complete_webhook_event(event.provider, &event.event_id, status, message)
                .await
            {
                Ok(()) => return,
                Err(e) if attempt == 1 => tracing::warn!(
                    event_id = %event.event_id,
                    error = %e,
                    "First attempt to record webhook result failed, retrying"
                ),
                Err(e) => tracing::error!(
                    event_id = %event.event_id,
                    status = %status,
                    error = %e,
                    "Failed to record webhook result; delivery stays re-claimable after timeout"
                ),
            }
        }
    }

    async fn apply(&self, event: &ProviderEvent) -> BillingResult<Disposition> {
        let provider = event.provider;
        let origin = |object_id: &str| Origin::Provider {
            provider,
            object_id: object_id.to_string(),
            event_id: event.event_id.clone(),
        };

        match &event.kind {
            ProviderEventKind::SubscriptionActivated(outcome) => self.grant(event, outcome).await,

            ProviderEventKind::CheckoutCompleted { checkout_id, purchase } => match purchase {
                Purchase::Subscription(outcome) => self.grant(event, outcome).await,
                Purchase::Anonymous { plan, amount_cents, .. } => {
                    let mut builder = BillingEventBuilder::new(None, BillingEventType::AnonymousPurchase)
                        .actor_type(ActorType::Provider)
                        .provider(provider)
                        .provider_event(event.event_id.clone())
                        .data(serde_json::json!({ "plan": plan, "checkout_id": checkout_id }));
                    if let Some(amount) = amount_cents {
                        builder = builder.amount_cents(*amount);
                    }
                    self.events.log(builder).await?;
                    Ok(Disposition::Applied)
                }
            },

            ProviderEventKind::SubscriptionRenewed {
                provider_object_id,
                period_end,
                amount_cents,
            } => {
                let Some(sub) = self.find(provider, provider_object_id).await? else {
                    return Ok(ignored("unknown_subscription"));
                };
                match self
                    .subscriptions
                    .renew(sub.user_id, *period_end, *amount_cents, origin(provider_object_id))
                    .await
                {
                    Ok(change) => Ok((&change).into()),
                    Err(BillingError::InvalidState(reason)) => {
                        tracing::info!(user_id = %sub.user_id, reason = %reason, "Renewal ignored");
                        Ok(ignored("not_renewable"))
                    }
                    Err(e) => Err(e),
                }
            }

            ProviderEventKind::SubscriptionUpdated {
                provider_object_id,
                status,
                period_end,
                cancel_at_period_end,
            } => {
                let Some(sub) = self.find(provider, provider_object_id).await? else {
                    return Ok(ignored("unknown_subscription"));
                };
                match status {
                    RemoteStatus::Ended => {
                        let change = self
                            .subscriptions
                            .cancel(sub.user_id, origin(provider_object_id))
                            .await?;
                        Ok((&change).into())
                    }
                    RemoteStatus::Active => {
                        let mut applied = false;
                        if let Some(end) = period_end {
                            match self
                                .subscriptions
                                .renew(sub.user_id, *end, None, origin(provider_object_id))
                                .await
                            {
                                Ok(change) => applied |= change.is_applied(),
                                Err(BillingError::InvalidState(_)) => {}
                                Err(e) => return Err(e),
                            }
                        }
                        let after = self
                            .subscriptions
                            .set_auto_renew(sub.user_id, !cancel_at_period_end)
                            .await?;
                        applied |= sub.auto_renew != after.auto_renew;
                        Ok(if applied {
                            Disposition::Applied
                        } else {
                            ignored("no_change")
                        })
                    }
                    // Grace period belongs to the provider's own retries
                    RemoteStatus::PastDue => Ok(ignored("past_due_grace")),
                    RemoteStatus::Other => Ok(ignored("unmapped_status")),
                }
            }

            ProviderEventKind::SubscriptionCancelled { provider_object_id } => {
                let Some(sub) = self.find(provider, provider_object_id).await? else {
                    return Ok(ignored("unknown_subscription"));
                };
                let change = self
                    .subscriptions
                    .cancel(sub.user_id, origin(provider_object_id))
                    .await?;
                Ok((&change).into())
            }

            ProviderEventKind::PaymentFailed {
                provider_object_id,
                customer_id,
                amount_cents,
            } => {
                let mut sub = match provider_object_id {
                    Some(id) => self.find(provider, id).await?,
                    None => None,
                };
                if sub.is_none() && provider == ProviderKind::Stripe {
                    if let Some(customer) = customer_id {
                        sub = self.store.find_by_stripe_customer(customer).await?;
                    }
                }
                let Some(sub) = sub else {
                    return Ok(ignored("unknown_subscription"));
                };

                let origin = Origin::Provider {
                    provider,
                    object_id: provider_object_id.clone().unwrap_or_default(),
                    event_id: event.event_id.clone(),
                };
                self.subscriptions
                    .record_payment_failure(sub.user_id, *amount_cents, origin)
                    .await;
                Ok(Disposition::Applied)
            }

            ProviderEventKind::Unhandled { event_type } => {
                Err(BillingError::UnknownEvent(event_type.clone()))
            }
        }
    }

    async fn find(&self, provider: ProviderKind, object_id: &str) -> BillingResult<Option<Subscription>> {
        self.store.find_by_provider_object(provider, object_id).await
    }

    /// Work out whose grant this is: metadata first, then existing correlation
    async fn resolve_user(&self, provider: ProviderKind, outcome: &GrantOutcome) -> BillingResult<Option<UserId>> {
        if let Some(user_id) = outcome.user_id {
            return Ok(Some(user_id));
        }
        if let Some(sub) = self.find(provider, &outcome.provider_object_id).await? {
            return Ok(Some(sub.user_id));
        }
        if provider == ProviderKind::Stripe {
            if let Some(customer) = outcome.customer_id.as_deref() {
                return Ok(self
                    .store
                    .find_by_stripe_customer(customer)
                    .await?
                    .map(|sub| sub.user_id));
            }
        }
        Ok(None)
    }

    async fn grant(&self, event: &ProviderEvent, outcome: &GrantOutcome) -> BillingResult<Disposition> {
        let Some(user_id) = self.resolve_user(event.provider, outcome).await? else {
            tracing::warn!(
                provider = %event.provider,
                provider_object_id = %outcome.provider_object_id,
                "Grant for a subscription with no known account"
            );
            return Ok(ignored("unknown_principal"));
        };

        let grant = outcome
            .clone()
            .into_grant(event.provider, event.event_id.clone(), event.occurred_at);
        let change = self.subscriptions.grant_paid(user_id, &grant).await?;
        Ok((&change).into())
    }

    /// Re-run a stored delivery from its normalized payload
    pub async fn replay(&self, provider: ProviderKind, event_id: &str) -> BillingResult<WebhookReplayResult> {
        let record = self
            .store
            .get_webhook_event(provider, event_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;

        let event: ProviderEvent = serde_json::from_value(record.payload.clone()).map_err(|e| {
            BillingError::Internal(format!("stored payload for {} is unreadable: {}", event_id, e))
        })?;

        // A delivery that succeeded already did its side effects (revenue,
        // notifications); running it again would repeat them.
        if record.processing_result != WebhookProcessingResult::Error.as_str() {
            return Err(BillingError::InvalidState(format!(
                "webhook event {} is '{}'; only failed deliveries can be replayed",
                event_id, record.processing_result
            )));
        }
        if !self.store.begin_webhook_replay(provider, event_id).await? {
            return Err(BillingError::StateConflict(format!(
                "webhook event {} is currently being processed",
                event_id
            )));
        }

        tracing::info!(
            provider = %provider,
            event_id = %event_id,
            previous_status = %record.processing_result,
            "Replaying webhook event"
        );

        let result = self.run_claimed(&event).await;
        let (new_status, new_error) = match &result {
            Ok(_) | Err(BillingError::UnknownEvent(_)) => (WebhookProcessingResult::Success, None),
            Err(e) => (WebhookProcessingResult::Error, Some(e.to_string())),
        };

        Ok(WebhookReplayResult {
            record_id: record.id,
            provider,
            event_id: event_id.to_string(),
            event_type: record.event_type,
            previous_status: record.processing_result,
            previous_error: record.error_message,
            new_status: new_status.to_string(),
            success: new_error.is_none(),
            new_error,
        })
    }

    /// Replay up to `limit` failed deliveries, oldest first
    pub async fn replay_all_failed(&self, limit: i64) -> BillingResult<Vec<WebhookReplayResult>> {
        let mut failed = self
            .store
            .list_webhook_events(Some(WebhookProcessingResult::Error.as_str()), limit, 0)
            .await?;
        failed.reverse();

        let mut results = Vec::with_capacity(failed.len());
        for record in failed {
            match self.replay(record.provider, &record.event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(event_id = %record.event_id, error = %e, "Failed to replay webhook");
                    results.push(WebhookReplayResult {
                        record_id: record.id,
                        provider: record.provider,
                        event_id: record.event_id,
                        event_type: record.event_type,
                        previous_status: record.processing_result,
                        previous_error: record.error_message,
                        new_status: WebhookProcessingResult::Error.to_string(),
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }
        Ok(results)
    }

    pub async fn list_webhooks(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.list_webhook_events(status_filter, limit, offset).await
    }

    /// Drop delivery records older than `days`
    pub async fn cleanup_older_than(&self, days: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(days);
        let deleted = self.store.delete_webhook_events_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted = deleted, retention_days = days, "Cleaned up old webhook events");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationTemplate;
    use crate::testing::{fake_headers, Fixture};
    use fixitflow_shared::{PlanTier, SubscriptionStatus};

    #[tokio::test]
    async fn test_invalid_signature_applies_nothing() {
        let fx = Fixture::new().await;
        let user = fx.user().await;
        let payload = fx.activation_payload("evt_1", user, "sub_1");

        let result = fx
            .billing
            .webhooks
            .handle(ProviderKind::Stripe, &payload, &SignatureHeaders::new())
            .await;
        assert!(matches!(result, Err(BillingError::InvalidSignature)));
        assert!(fx.store.list_webhook_events(None, 10, 0).await.unwrap().is_empty());
        assert_eq!(fx.subscription(user).await.plan, PlanTier::Free);
    }

    #[tokio::test]
    async fn test_unhandled_event_is_acknowledged() {
        let fx = Fixture::new().await;
        let event = ProviderEvent {
            provider: ProviderKind::Stripe,
            event_id: "evt_x".into(),
            event_type: "customer.created".into(),
            occurred_at: OffsetDateTime::now_utc(),
            kind: ProviderEventKind::Unhandled {
                event_type: "customer.created".into(),
            },
        };
        let payload = serde_json::to_string(&event).unwrap();

        let result = fx
            .billing
            .webhooks
            .handle(ProviderKind::Stripe, &payload, &fake_headers())
            .await;
        assert!(matches!(result, Err(BillingError::UnknownEvent(_))));

        let record = fx
            .store
            .get_webhook_event(ProviderKind::Stripe, "evt_x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.processing_result, "success");
    }

    #[tokio::test]
    async fn test_failed_event_can_be_replayed() {
        let fx = Fixture::new().await;
        let ghost = UserId::new();
        let payload = fx.activation_payload("evt_1", ghost, "sub_1");

        // Account does not exist yet: processing fails and is recorded
        let result = fx
            .billing
            .webhooks
            .handle(ProviderKind::Stripe, &payload, &fake_headers())
            .await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
        let failed = fx.billing.webhooks.list_webhooks(Some("error"), 10, 0).await.unwrap();
        assert_eq!(failed.len(), 1);

        fx.store.create_user(ghost, None, OffsetDateTime::now_utc()).await;
        let replay = fx.billing.webhooks.replay(ProviderKind::Stripe, "evt_1").await.unwrap();
        assert!(replay.success);
        assert_eq!(replay.previous_status, "error");
        assert_eq!(fx.subscription(ghost).await.plan, PlanTier::Monthly);
        assert_eq!(fx.notifier.count(NotificationTemplate::SubscriptionGranted).await, 1);
    }

    #[tokio::test]
    async fn test_successful_deliveries_are_not_replayed() {
        let fx = Fixture::new().await;
        let user = fx.user().await;
        let payload = fx.activation_payload("evt_1", user, "sub_1");
        fx.billing
            .webhooks
            .handle(ProviderKind::Stripe, &payload, &fake_headers())
            .await
            .unwrap();

        let purchase = fx.payload(
            "evt_2",
            ProviderEventKind::CheckoutCompleted {
                checkout_id: "cs_anon_1".into(),
                purchase: Purchase::Anonymous {
                    plan: PlanTier::Daily,
                    amount_cents: Some(299),
                    purchased_at: OffsetDateTime::now_utc(),
                },
            },
        );
        let failed = fx.payload(
            "evt_3",
            ProviderEventKind::PaymentFailed {
                provider_object_id: Some("sub_1".into()),
                customer_id: None,
                amount_cents: Some(999),
            },
        );
        for body in [&purchase, &failed] {
            fx.billing
                .webhooks
                .handle(ProviderKind::Stripe, body, &fake_headers())
                .await
                .unwrap();
        }

        for event_id in ["evt_1", "evt_2", "evt_3"] {
            let result = fx.billing.webhooks.replay(ProviderKind::Stripe, event_id).await;
            assert!(
                matches!(result, Err(BillingError::InvalidState(_))),
                "{} should not be replayable",
                event_id
            );
        }

        let anonymous_revenue: i64 = fx
            .store
            .billing_events()
            .await
            .iter()
            .filter(|e| e.event_type == BillingEventType::AnonymousPurchase)
            .filter_map(|e| e.amount_cents)
            .sum();
        assert_eq!(anonymous_revenue, 299);
        assert_eq!(fx.notifier.count(NotificationTemplate::PaymentFailed).await, 1);
        assert_eq!(fx.notifier.count(NotificationTemplate::SubscriptionGranted).await, 1);

        let record = fx
            .store
            .get_webhook_event(ProviderKind::Stripe, "evt_2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.processing_result, "success");
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_payment_failed_notifies_without_revoking() {
        let fx = Fixture::new().await;
        let user = fx.user().await;
        let payload = fx.activation_payload("evt_1", user, "sub_1");
        fx.billing
            .webhooks
            .handle(ProviderKind::Stripe, &payload, &fake_headers())
            .await
            .unwrap();

        let failed = fx.payload(
            "evt_2",
            ProviderEventKind::PaymentFailed {
                provider_object_id: Some("sub_1".into()),
                customer_id: None,
                amount_cents: Some(999),
            },
        );
        let outcome = fx
            .billing
            .webhooks
            .handle(ProviderKind::Stripe, &failed, &fake_headers())
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Applied);

        let sub = fx.subscription(user).await;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan, PlanTier::Monthly);
        assert_eq!(fx.notifier.count(NotificationTemplate::PaymentFailed).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_turns_off_auto_renew() {
        let fx = Fixture::new().await;
        let user = fx.user().await;
        let payload = fx.activation_payload("evt_1", user, "sub_1");
        fx.billing
            .webhooks
            .handle(ProviderKind::Stripe, &payload, &fake_headers())
            .await
            .unwrap();

        let update = fx.payload(
            "evt_2",
            ProviderEventKind::SubscriptionUpdated {
                provider_object_id: "sub_1".into(),
                status: RemoteStatus::Active,
                period_end: None,
                cancel_at_period_end: true,
            },
        );
        let outcome = fx
            .billing
            .webhooks
            .handle(ProviderKind::Stripe, &update, &fake_headers())
            .await
            .unwrap();
        assert_eq!(outcome.disposition, Disposition::Applied);
        assert!(!fx.subscription(user).await.auto_renew);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_events() {
        let fx = Fixture::new().await;
        let user = fx.user().await;
        let payload = fx.activation_payload("evt_1", user, "sub_1");
        fx.billing
            .webhooks
            .handle(ProviderKind::Stripe, &payload, &fake_headers())
            .await
            .unwrap();

        assert_eq!(fx.billing.webhooks.cleanup_older_than(90).await.unwrap(), 0);
        assert_eq!(fx.billing.webhooks.list_webhooks(None, 10, 0).await.unwrap().len(), 1);
    }
}
