//! Subscription lifecycle service
//!
//! Every mutation is load, pure transition, compare-and-swap. A lost race is
//! retried once against the fresh record; a second loss surfaces as
//! `StateConflict`. Notifications and billing events fire only after a write
//! actually lands, so replays and no-op transitions stay silent.

use std::sync::Arc;

use fixitflow_shared::{ProviderKind, SubscriptionStatus, UserId};
use serde_json::json;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::notify::{NotificationTemplate, Notifier};
use crate::plans::PlanCatalog;
use crate::providers::ProviderRegistry;
use crate::store::BillingStore;
use crate::subscription::{GrantDecision, PaidGrant, Subscription};

/// Attempts at a compare-and-swap before giving up
const MAX_WRITE_ATTEMPTS: usize = 2;

/// Who asked for a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    User,
    System,
    /// A verified provider event about `object_id`
    Provider {
        provider: ProviderKind,
        object_id: String,
        event_id: String,
    },
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Provider { .. } => "provider",
        }
    }

    fn actor_type(&self) -> ActorType {
        match self {
            Self::User => ActorType::User,
            Self::System => ActorType::System,
            Self::Provider { .. } => ActorType::Provider,
        }
    }

    fn tag(&self, builder: BillingEventBuilder) -> BillingEventBuilder {
        let builder = builder.actor_type(self.actor_type());
        match self {
            Self::Provider {
                provider, event_id, ..
            } => builder.provider(*provider).provider_event(event_id.clone()),
            _ => builder,
        }
    }

    /// Provider events only apply to the record still bound to their object
    fn matches(&self, sub: &Subscription) -> bool {
        match self {
            Self::Provider {
                provider, object_id, ..
            } => sub.provider_object_id(*provider) == Some(object_id.as_str()),
            _ => true,
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a lifecycle operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Applied {
        before: Box<Subscription>,
        after: Box<Subscription>,
    },
    Unchanged {
        current: Box<Subscription>,
        reason: &'static str,
    },
}

impl Change {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Record as it stands after the operation
    pub fn subscription(&self) -> &Subscription {
        match self {
            Self::Applied { after, .. } => after,
            Self::Unchanged { current, .. } => current,
        }
    }

    pub fn into_subscription(self) -> Subscription {
        match self {
            Self::Applied { after, .. } => *after,
            Self::Unchanged { current, .. } => *current,
        }
    }
}

enum Step {
    Apply(Subscription),
    Skip(&'static str),
}

impl From<Option<Subscription>> for Step {
    fn from(next: Option<Subscription>) -> Self {
        match next {
            Some(next) => Step::Apply(next),
            None => Step::Skip("no_change"),
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn Notifier>,
    events: BillingEventLogger,
    providers: Arc<ProviderRegistry>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        notifier: Arc<dyn Notifier>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            events: BillingEventLogger::new(Arc::clone(&store)),
            store,
            notifier,
            providers,
        }
    }

    pub async fn get(&self, user_id: UserId) -> BillingResult<Subscription> {
        self.store
            .load_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }

    async fn mutate<F>(&self, user_id: UserId, mut transition: F) -> BillingResult<Change>
    where
        F: FnMut(&Subscription) -> BillingResult<Step>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.get(user_id).await?;
            let next = match transition(&current)? {
                Step::Apply(next) => next,
                Step::Skip(reason) => {
                    return Ok(Change::Unchanged {
                        current: Box::new(current),
                        reason,
                    })
                }
            };

            if self.store.compare_and_swap(current.version, &next).await? {
                let mut after = next;
                after.version = current.version + 1;
                return Ok(Change::Applied {
                    before: Box::new(current),
                    after: Box::new(after),
                });
            }

            tracing::debug!(
                user_id = %user_id,
                attempt = attempt,
                "Subscription changed underneath us, reloading"
            );
        }

        tracing::warn!(user_id = %user_id, "Giving up after repeated write conflicts");
        Err(BillingError::StateConflict(format!(
            "subscription for user {} is being modified concurrently",
            user_id
        )))
    }

    fn log_transition(change: &Change, operation: &str, origin: &Origin) {
        match change {
            Change::Applied { before, after } => tracing::info!(
                user_id = %after.user_id,
                operation = operation,
                origin = %origin,
                from_status = %before.status,
                to_status = %after.status,
                from_plan = %before.plan,
                to_plan = %after.plan,
                end_date = ?after.end_date,
                "Subscription transition applied"
            ),
            Change::Unchanged { current, reason } => tracing::info!(
                user_id = %current.user_id,
                operation = operation,
                origin = %origin,
                reason = reason,
                "Subscription transition skipped"
            ),
        }
    }

    /// Start the one-per-account trial
    pub async fn start_trial(&self, user_id: UserId) -> BillingResult<Subscription> {
        let now = OffsetDateTime::now_utc();
        let change = self
            .mutate(user_id, |current| current.start_trial(now).map(Step::Apply))
            .await?;
        Self::log_transition(&change, "start_trial", &Origin::User);

        let sub = change.into_subscription();
        self.events
            .log_or_warn(
                BillingEventBuilder::new(Some(user_id), BillingEventType::TrialStarted)
                    .actor_type(ActorType::User)
                    .data(json!({ "plan": sub.plan, "end_date": sub.end_date.map(|d| d.unix_timestamp()) })),
            )
            .await;
        self.notifier
            .notify(
                user_id,
                NotificationTemplate::TrialStarted,
                json!({ "plan": sub.plan, "days_remaining": sub.days_remaining(now) }),
            )
            .await;
        Ok(sub)
    }

    /// Apply an authenticated paid grant. Duplicate and stale grants are
    /// reported as `Unchanged` and produce no side effects.
    pub async fn grant_paid(&self, user_id: UserId, grant: &PaidGrant) -> BillingResult<Change> {
        let now = OffsetDateTime::now_utc();
        let change = self
            .mutate(user_id, |current| {
                Ok(match current.grant_paid(grant, now)? {
                    GrantDecision::Apply(next) => Step::Apply(*next),
                    GrantDecision::Duplicate => Step::Skip("duplicate_grant"),
                    GrantDecision::Stale => Step::Skip("stale_grant"),
                })
            })
            .await?;

        let origin = Origin::Provider {
            provider: grant.provider,
            object_id: grant.provider_object_id.clone(),
            event_id: grant.grant_ref.clone(),
        };
        Self::log_transition(&change, "grant_paid", &origin);

        if let Change::Applied { after, .. } = &change {
            let plan = PlanCatalog::get(after.plan);
            self.events
                .log_or_warn(
                    origin
                        .tag(BillingEventBuilder::new(Some(user_id), BillingEventType::SubscriptionGranted))
                        .amount_cents(plan.price_cents)
                        .data(json!({
                            "plan": after.plan,
                            "provider_object_id": grant.provider_object_id,
                            "end_date": after.end_date.map(|d| d.unix_timestamp()),
                        })),
                )
                .await;
            self.notifier
                .notify(
                    user_id,
                    NotificationTemplate::SubscriptionGranted,
                    json!({ "plan": after.plan, "days_remaining": after.days_remaining(now) }),
                )
                .await;
        }
        Ok(change)
    }

    /// Extend an active paid term to `new_end`
    pub async fn renew(
        &self,
        user_id: UserId,
        new_end: OffsetDateTime,
        amount_cents: Option<i64>,
        origin: Origin,
    ) -> BillingResult<Change> {
        let change = self
            .mutate(user_id, |current| {
                if !origin.matches(current) {
                    return Ok(Step::Skip("correlation_mismatch"));
                }
                current.renew(new_end).map(Step::from)
            })
            .await?;
        Self::log_transition(&change, "renew", &origin);

        if let Change::Applied { after, .. } = &change {
            let amount = amount_cents.unwrap_or(PlanCatalog::get(after.plan).price_cents);
            self.events
                .log_or_warn(
                    origin
                        .tag(BillingEventBuilder::new(Some(user_id), BillingEventType::SubscriptionRenewed))
                        .amount_cents(amount)
                        .data(json!({ "plan": after.plan, "end_date": new_end.unix_timestamp() })),
                )
                .await;
            self.notifier
                .notify(
                    user_id,
                    NotificationTemplate::SubscriptionRenewed,
                    json!({ "plan": after.plan }),
                )
                .await;
        }
        Ok(change)
    }

    /// Cancel immediately. A user-initiated cancel with nothing to cancel is
    /// an error; provider-initiated ones are silently skipped. The provider
    /// side is revoked best-effort after the local write.
    pub async fn cancel(&self, user_id: UserId, origin: Origin) -> BillingResult<Change> {
        let now = OffsetDateTime::now_utc();
        let change = self
            .mutate(user_id, |current| {
                if !origin.matches(current) {
                    return Ok(Step::Skip("correlation_mismatch"));
                }
                Ok(current.cancel(now).map_or(Step::Skip("nothing_to_cancel"), Step::Apply))
            })
            .await?;
        Self::log_transition(&change, "cancel", &origin);

        let Change::Applied { before, after } = &change else {
            if origin == Origin::User {
                let current = change.subscription();
                return Err(BillingError::InvalidState(format!(
                    "No active subscription or trial to cancel (status {}, plan {})",
                    current.status, current.plan
                )));
            }
            return Ok(change);
        };

        self.events
            .log_or_warn(
                origin
                    .tag(BillingEventBuilder::new(Some(user_id), BillingEventType::SubscriptionCancelled))
                    .data(json!({ "previous_plan": before.plan, "previous_status": before.status })),
            )
            .await;
        self.notifier
            .notify(
                user_id,
                NotificationTemplate::SubscriptionCancelled,
                json!({ "plan": before.plan }),
            )
            .await;

        if origin == Origin::User && before.status == SubscriptionStatus::Active {
            if let Some((provider, object_id)) = before.active_provider() {
                self.revoke_best_effort(user_id, provider, object_id).await;
            }
        }

        tracing::debug!(user_id = %user_id, status = %after.status, "Cancellation complete");
        Ok(change)
    }

    async fn revoke_best_effort(&self, user_id: UserId, provider: ProviderKind, object_id: &str) {
        let adapter = match self.providers.get(provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(
                    user_id = %user_id,
                    provider = %provider,
                    error = %e,
                    "Provider not configured; subscription left to lapse provider-side"
                );
                return;
            }
        };
        if let Err(e) = adapter.revoke(object_id).await {
            tracing::warn!(
                user_id = %user_id,
                provider = %provider,
                provider_object_id = %object_id,
                error = %e,
                "Failed to revoke provider subscription; local cancellation stands"
            );
        }
    }

    /// Demote a lapsed term to free
    pub async fn expire_if_past_due(&self, user_id: UserId, now: OffsetDateTime) -> BillingResult<Change> {
        let change = self
            .mutate(user_id, |current| Ok(current.expire_if_past_due(now).into()))
            .await?;

        if let Change::Applied { before, .. } = &change {
            Self::log_transition(&change, "expire", &Origin::System);
            self.events
                .log_or_warn(
                    BillingEventBuilder::new(Some(user_id), BillingEventType::SubscriptionExpired)
                        .data(json!({ "previous_plan": before.plan, "previous_status": before.status })),
                )
                .await;
            self.notifier
                .notify(
                    user_id,
                    NotificationTemplate::SubscriptionExpired,
                    json!({ "plan": before.plan }),
                )
                .await;
        }
        Ok(change)
    }

    pub async fn set_auto_renew(&self, user_id: UserId, enabled: bool) -> BillingResult<Subscription> {
        let change = self
            .mutate(user_id, |current| Ok(current.set_auto_renew(enabled).into()))
            .await?;

        if change.is_applied() {
            tracing::info!(user_id = %user_id, auto_renew = enabled, "Auto-renew changed");
            self.events
                .log_or_warn(
                    BillingEventBuilder::new(Some(user_id), BillingEventType::AutoRenewChanged)
                        .actor_type(ActorType::User)
                        .data(json!({ "auto_renew": enabled })),
                )
                .await;
        }
        Ok(change.into_subscription())
    }

    /// Flag the current term as warned; `true` if this call set the flag
    pub async fn mark_expiry_warned(&self, user_id: UserId, now: OffsetDateTime) -> BillingResult<bool> {
        let change = self
            .mutate(user_id, |current| Ok(current.mark_expiry_warned(now).into()))
            .await?;
        Ok(change.is_applied())
    }

    /// Payment failures never change the record; the provider retries
    pub async fn record_payment_failure(
        &self,
        user_id: UserId,
        amount_cents: Option<i64>,
        origin: Origin,
    ) {
        tracing::info!(user_id = %user_id, origin = %origin, "Payment failed; access unchanged");
        self.events
            .log_or_warn(
                origin
                    .tag(BillingEventBuilder::new(Some(user_id), BillingEventType::PaymentFailed))
                    .data(json!({ "amount_due_cents": amount_cents })),
            )
            .await;
        self.notifier
            .notify(
                user_id,
                NotificationTemplate::PaymentFailed,
                json!({ "amount_due_cents": amount_cents }),
            )
            .await;
    }
}
