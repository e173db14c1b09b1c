//! Billing audit events
//!
//! Every entitlement change and every unit of revenue is appended to the
//! billing event log. Logging never fails the operation that triggered it.

use std::sync::Arc;

use fixitflow_shared::{ProviderKind, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    TrialStarted,
    SubscriptionGranted,
    SubscriptionRenewed,
    SubscriptionCancelled,
    SubscriptionExpired,
    AutoRenewChanged,
    PaymentFailed,
    AnonymousPurchase,
    ExpiryWarningSent,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TrialStarted => "trial_started",
            Self::SubscriptionGranted => "subscription_granted",
            Self::SubscriptionRenewed => "subscription_renewed",
            Self::SubscriptionCancelled => "subscription_cancelled",
            Self::SubscriptionExpired => "subscription_expired",
            Self::AutoRenewChanged => "auto_renew_changed",
            Self::PaymentFailed => "payment_failed",
            Self::AnonymousPurchase => "anonymous_purchase",
            Self::ExpiryWarningSent => "expiry_warning_sent",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
    Provider,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
            Self::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Option<UserId>,
    pub event_type: BillingEventType,
    pub actor_type: ActorType,
    pub provider: Option<ProviderKind>,
    pub provider_event_id: Option<String>,
    /// Revenue recognised by this event, if any
    pub amount_cents: Option<i64>,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

pub struct BillingEventBuilder {
    event: BillingEvent,
}

impl BillingEventBuilder {
    pub fn new(user_id: Option<UserId>, event_type: BillingEventType) -> Self {
        Self {
            event: BillingEvent {
                id: Uuid::new_v4(),
                user_id,
                event_type,
                actor_type: ActorType::System,
                provider: None,
                provider_event_id: None,
                amount_cents: None,
                data: serde_json::Value::Null,
                created_at: OffsetDateTime::now_utc(),
            },
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event.data = data;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.event.actor_type = actor_type;
        self
    }

    pub fn provider(mut self, provider: ProviderKind) -> Self {
        self.event.provider = Some(provider);
        self
    }

    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.event.provider_event_id = Some(event_id.into());
        self
    }

    pub fn amount_cents(mut self, amount: i64) -> Self {
        self.event.amount_cents = Some(amount);
        self
    }

    pub fn build(self) -> BillingEvent {
        self.event
    }
}

#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn BillingStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn log(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event = builder.build();
        self.store.append_billing_event(&event).await?;
        Ok(event.id)
    }

    /// Log, downgrading failures to a warning
    pub async fn log_or_warn(&self, builder: BillingEventBuilder) {
        let event = builder.build();
        if let Err(e) = self.store.append_billing_event(&event).await {
            tracing::warn!(
                event_type = %event.event_type,
                user_id = ?event.user_id,
                error = %e,
                "Failed to log billing event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBillingStore;

    #[tokio::test]
    async fn test_builder_fields_reach_store() {
        let store = Arc::new(MemoryBillingStore::new());
        let logger = BillingEventLogger::new(store.clone());
        let user = UserId::new();

        logger
            .log(
                BillingEventBuilder::new(Some(user), BillingEventType::SubscriptionGranted)
                    .provider(ProviderKind::Stripe)
                    .provider_event("evt_1")
                    .amount_cents(999)
                    .actor_type(ActorType::Provider)
                    .data(serde_json::json!({ "plan": "monthly" })),
            )
            .await
            .unwrap();

        let events = store.billing_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, Some(user));
        assert_eq!(events[0].amount_cents, Some(999));
        assert_eq!(events[0].actor_type, ActorType::Provider);
        assert_eq!(events[0].provider_event_id.as_deref(), Some("evt_1"));
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(BillingEventType::AnonymousPurchase.to_string(), "anonymous_purchase");
        assert_eq!(ActorType::Provider.as_str(), "provider");
    }
}
