//! Subscription record store
//!
//! `BillingStore` is the persistence seam for everything the engine writes:
//! the subscription sub-record on each user, webhook delivery claims, and
//! the billing audit trail. `PgBillingStore` backs production;
//! `MemoryBillingStore` backs tests and local runs without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use fixitflow_shared::{ProviderKind, SubscriptionStatus, UserId};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::subscription::Subscription;

/// How long a `processing` claim is honoured before another delivery may take it over
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Processing state of a stored webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookProcessingResult {
    Processing,
    Success,
    Error,
    Replaying,
}

impl WebhookProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
            Self::Replaying => "replaying",
        }
    }
}

impl std::fmt::Display for WebhookProcessingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to take exclusive processing rights for one delivery
#[derive(Debug, Clone)]
pub struct WebhookClaim {
    pub provider: ProviderKind,
    pub event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    /// Normalized, already-authenticated event kept for replay
    pub payload: serde_json::Value,
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider: ProviderKind,
    pub event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub payload: serde_json::Value,
    pub processing_result: String,
    pub processing_started_at: OffsetDateTime,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Subscription records

    async fn load_subscription(&self, user_id: UserId) -> BillingResult<Option<Subscription>>;

    /// Record currently (or most recently) correlated with a provider object
    async fn find_by_provider_object(
        &self,
        provider: ProviderKind,
        object_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    async fn find_by_stripe_customer(&self, customer_id: &str) -> BillingResult<Option<Subscription>>;

    /// Write `next` only if the stored version still equals `expected_version`.
    /// Returns `false` when another writer got there first. The store bumps
    /// the version; `next.version` is ignored.
    async fn compare_and_swap(&self, expected_version: i64, next: &Subscription) -> BillingResult<bool>;

    /// Active or trial records whose term ended at or before `now`
    async fn list_past_due(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Subscription>>;

    /// Records with access ending inside `(from, to]` that have not been warned
    async fn list_expiring(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    async fn user_email(&self, user_id: UserId) -> BillingResult<Option<String>>;

    // Webhook idempotency

    /// Claim a delivery. `true` when this caller now owns processing; `false`
    /// when it already succeeded or another worker is on it.
    async fn claim_webhook_event(&self, claim: &WebhookClaim) -> BillingResult<bool>;

    async fn complete_webhook_event(
        &self,
        provider: ProviderKind,
        event_id: &str,
        result: WebhookProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn get_webhook_event(
        &self,
        provider: ProviderKind,
        event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>>;

    /// Mark a failed delivery as being replayed; `false` unless it is in `error`
    async fn begin_webhook_replay(&self, provider: ProviderKind, event_id: &str) -> BillingResult<bool>;

    async fn list_webhook_events(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    async fn delete_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64>;

    // Audit trail

    async fn append_billing_event(&self, event: &BillingEvent) -> BillingResult<()>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// In-memory `BillingStore` for tests and database-less development
#[derive(Default)]
pub struct MemoryBillingStore {
    subscriptions: RwLock<HashMap<UserId, Subscription>>,
    emails: RwLock<HashMap<UserId, String>>,
    webhooks: Mutex<HashMap<(ProviderKind, String), WebhookEventRecord>>,
    events: Mutex<Vec<BillingEvent>>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the default free record for a new account
    pub async fn create_user(&self, user_id: UserId, email: Option<&str>, now: OffsetDateTime) -> Subscription {
        let sub = Subscription::default_free(user_id, now);
        self.subscriptions.write().await.insert(user_id, sub.clone());
        if let Some(email) = email {
            self.emails.write().await.insert(user_id, email.to_string());
        }
        sub
    }

    /// Overwrite a record directly, bypassing the version check
    pub async fn put_subscription(&self, sub: Subscription) {
        self.subscriptions.write().await.insert(sub.user_id, sub);
    }

    pub async fn billing_events(&self) -> Vec<BillingEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn load_subscription(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(&user_id).cloned())
    }

    async fn find_by_provider_object(
        &self,
        provider: ProviderKind,
        object_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .find(|sub| sub.provider_object_id(provider) == Some(object_id))
            .cloned())
    }

    async fn find_by_stripe_customer(&self, customer_id: &str) -> BillingResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .await
            .values()
            .find(|sub| sub.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn compare_and_swap(&self, expected_version: i64, next: &Subscription) -> BillingResult<bool> {
        let mut subs = self.subscriptions.write().await;

        let current_version = match subs.get(&next.user_id) {
            Some(current) => current.version,
            None => return Err(BillingError::NotFound(format!("user {}", next.user_id))),
        };
        if current_version != expected_version {
            return Ok(false);
        }

        // Mirror the partial unique indexes on the provider object columns
        for (provider, id) in [
            (ProviderKind::Stripe, next.stripe_subscription_id.as_deref()),
            (ProviderKind::PayPal, next.paypal_subscription_id.as_deref()),
        ] {
            let Some(id) = id else { continue };
            let taken = subs
                .values()
                .any(|other| other.user_id != next.user_id && other.provider_object_id(provider) == Some(id));
            if taken {
                return Err(BillingError::Database(format!(
                    "{} subscription {} already belongs to another user",
                    provider, id
                )));
            }
        }

        let mut stored = next.clone();
        stored.version = expected_version + 1;
        subs.insert(next.user_id, stored);
        Ok(true)
    }

    async fn list_past_due(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Subscription>> {
        let mut due: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|sub| sub.is_past_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|sub| sub.end_date);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn list_expiring(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let mut expiring: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .values()
            .filter(|sub| {
                matches!(sub.status, SubscriptionStatus::Active | SubscriptionStatus::Trial)
                    && sub.expiry_warning_sent_at.is_none()
                    && sub.end_date.is_some_and(|end| end > from && end <= to)
            })
            .cloned()
            .collect();
        expiring.sort_by_key(|sub| sub.end_date);
        expiring.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(expiring)
    }

    async fn user_email(&self, user_id: UserId) -> BillingResult<Option<String>> {
        Ok(self.emails.read().await.get(&user_id).cloned())
    }

    async fn claim_webhook_event(&self, claim: &WebhookClaim) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut webhooks = self.webhooks.lock().await;
        let key = (claim.provider, claim.event_id.clone());

        if let Some(existing) = webhooks.get_mut(&key) {
            let in_flight = existing.processing_result == WebhookProcessingResult::Processing.as_str()
                || existing.processing_result == WebhookProcessingResult::Replaying.as_str();
            let stuck = in_flight
                && existing.processing_started_at
                    < now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES);
            let failed = existing.processing_result == WebhookProcessingResult::Error.as_str();
            if !(stuck || failed) {
                return Ok(false);
            }
            existing.processing_result = WebhookProcessingResult::Processing.to_string();
            existing.processing_started_at = now;
            existing.attempts += 1;
            return Ok(true);
        }

        webhooks.insert(
            key,
            WebhookEventRecord {
                id: Uuid::new_v4(),
                provider: claim.provider,
                event_id: claim.event_id.clone(),
                event_type: claim.event_type.clone(),
                event_timestamp: claim.event_timestamp,
                payload: claim.payload.clone(),
                processing_result: WebhookProcessingResult::Processing.to_string(),
                processing_started_at: now,
                error_message: None,
                attempts: 1,
                created_at: now,
            },
        );
        Ok(true)
    }

    async fn complete_webhook_event(
        &self,
        provider: ProviderKind,
        event_id: &str,
        result: WebhookProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut webhooks = self.webhooks.lock().await;
        let record = webhooks
            .get_mut(&(provider, event_id.to_string()))
            .ok_or_else(|| BillingError::NotFound(format!("webhook {}", event_id)))?;
        record.processing_result = result.to_string();
        record.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn get_webhook_event(
        &self,
        provider: ProviderKind,
        event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self
            .webhooks
            .lock()
            .await
            .get(&(provider, event_id.to_string()))
            .cloned())
    }

    async fn begin_webhook_replay(&self, provider: ProviderKind, event_id: &str) -> BillingResult<bool> {
        let mut webhooks = self.webhooks.lock().await;
        let Some(record) = webhooks.get_mut(&(provider, event_id.to_string())) else {
            return Ok(false);
        };
        if record.processing_result != WebhookProcessingResult::Error.as_str() {
            return Ok(false);
        }
        record.processing_result = WebhookProcessingResult::Replaying.to_string();
        record.processing_started_at = OffsetDateTime::now_utc();
        record.attempts += 1;
        Ok(true)
    }

    async fn list_webhook_events(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let mut records: Vec<WebhookEventRecord> = self
            .webhooks
            .lock()
            .await
            .values()
            .filter(|r| status_filter.map_or(true, |s| r.processing_result == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(0))
            .take(usize::try_from(limit).unwrap_or(0))
            .collect())
    }

    async fn delete_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let mut webhooks = self.webhooks.lock().await;
        let before = webhooks.len();
        webhooks.retain(|_, r| r.created_at >= cutoff);
        Ok((before - webhooks.len()) as u64)
    }

    async fn append_billing_event(&self, event: &BillingEvent) -> BillingResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixitflow_shared::PlanTier;

    fn claim(id: &str) -> WebhookClaim {
        WebhookClaim {
            provider: ProviderKind::Stripe,
            event_id: id.to_string(),
            event_type: "customer.subscription.created".to_string(),
            event_timestamp: OffsetDateTime::now_utc(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = MemoryBillingStore::new();
        let user = UserId::new();
        let sub = store.create_user(user, None, OffsetDateTime::now_utc()).await;

        let mut next = sub.clone();
        next.auto_renew = true;
        assert!(store.compare_and_swap(0, &next).await.unwrap());
        assert!(!store.compare_and_swap(0, &next).await.unwrap());

        let stored = store.load_subscription(user).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_cas_enforces_unique_provider_object() {
        let store = MemoryBillingStore::new();
        let now = OffsetDateTime::now_utc();
        let a = store.create_user(UserId::new(), None, now).await;
        let b = store.create_user(UserId::new(), None, now).await;

        let mut a_next = a.clone();
        a_next.plan = PlanTier::Monthly;
        a_next.stripe_subscription_id = Some("sub_1".into());
        assert!(store.compare_and_swap(0, &a_next).await.unwrap());

        let mut b_next = b.clone();
        b_next.stripe_subscription_id = Some("sub_1".into());
        assert!(matches!(
            store.compare_and_swap(0, &b_next).await,
            Err(BillingError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_claim_once_then_reclaim_after_error() {
        let store = MemoryBillingStore::new();
        assert!(store.claim_webhook_event(&claim("evt_1")).await.unwrap());
        assert!(!store.claim_webhook_event(&claim("evt_1")).await.unwrap());

        store
            .complete_webhook_event(ProviderKind::Stripe, "evt_1", WebhookProcessingResult::Error, Some("boom"))
            .await
            .unwrap();
        assert!(store.claim_webhook_event(&claim("evt_1")).await.unwrap());

        store
            .complete_webhook_event(ProviderKind::Stripe, "evt_1", WebhookProcessingResult::Success, None)
            .await
            .unwrap();
        assert!(!store.claim_webhook_event(&claim("evt_1")).await.unwrap());

        let record = store
            .get_webhook_event(ProviderKind::Stripe, "evt_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.processing_result, "success");
    }

    #[tokio::test]
    async fn test_replay_only_starts_from_error() {
        let store = MemoryBillingStore::new();
        store.claim_webhook_event(&claim("evt_1")).await.unwrap();
        // Still processing
        assert!(!store.begin_webhook_replay(ProviderKind::Stripe, "evt_1").await.unwrap());

        store
            .complete_webhook_event(ProviderKind::Stripe, "evt_1", WebhookProcessingResult::Success, None)
            .await
            .unwrap();
        assert!(!store.begin_webhook_replay(ProviderKind::Stripe, "evt_1").await.unwrap());

        store
            .complete_webhook_event(ProviderKind::Stripe, "evt_1", WebhookProcessingResult::Error, Some("boom"))
            .await
            .unwrap();
        assert!(store.begin_webhook_replay(ProviderKind::Stripe, "evt_1").await.unwrap());
        // Now replaying
        assert!(!store.begin_webhook_replay(ProviderKind::Stripe, "evt_1").await.unwrap());
        assert!(!store.begin_webhook_replay(ProviderKind::Stripe, "evt_missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_stuck_replay_is_reclaimable() {
        let store = MemoryBillingStore::new();
        store.claim_webhook_event(&claim("evt_1")).await.unwrap();
        store
            .complete_webhook_event(ProviderKind::Stripe, "evt_1", WebhookProcessingResult::Error, Some("boom"))
            .await
            .unwrap();
        assert!(store.begin_webhook_replay(ProviderKind::Stripe, "evt_1").await.unwrap());

        // A fresh replay holds the row
        assert!(!store.claim_webhook_event(&claim("evt_1")).await.unwrap());

        // A replay that died mid-way gives the row up after the timeout
        if let Some(record) = store
            .webhooks
            .lock()
            .await
            .get_mut(&(ProviderKind::Stripe, "evt_1".to_string()))
        {
            record.processing_started_at =
                OffsetDateTime::now_utc() - Duration::minutes(PROCESSING_TIMEOUT_MINUTES + 1);
        }
        assert!(store.claim_webhook_event(&claim("evt_1")).await.unwrap());

        let record = store
            .get_webhook_event(ProviderKind::Stripe, "evt_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.processing_result, "processing");
        assert_eq!(record.attempts, 3);
    }

    #[tokio::test]
    async fn test_same_event_id_different_providers_are_distinct() {
        let store = MemoryBillingStore::new();
        assert!(store.claim_webhook_event(&claim("evt_1")).await.unwrap());
        let mut paypal = claim("evt_1");
        paypal.provider = ProviderKind::PayPal;
        assert!(store.claim_webhook_event(&paypal).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_webhook_events_before() {
        let store = MemoryBillingStore::new();
        store.claim_webhook_event(&claim("evt_1")).await.unwrap();
        let removed = store
            .delete_webhook_events_before(OffsetDateTime::now_utc() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.list_webhook_events(None, 10, 0).await.unwrap().is_empty());
    }
}
