//! Shared fixtures for unit and scenario tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fixitflow_shared::{PlanTier, ProviderKind, UserId};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};
use crate::notify::RecordingNotifier;
use crate::providers::{
    CheckoutGrant, CheckoutPrincipal, CheckoutState, GrantOutcome, PaymentProvider, ProviderEvent,
    ProviderEventKind, ProviderRegistry, SignatureHeaders,
};
use crate::store::{BillingStore, MemoryBillingStore};
use crate::subscription::Subscription;
use crate::usage::MemoryUsageStore;
use crate::BillingService;

pub const TOKEN_SECRET: &[u8] = b"test-token-signing-secret";
pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";

/// Headers the fake provider accepts as authentic
pub fn fake_headers() -> SignatureHeaders {
    SignatureHeaders::new().with(FAKE_SIGNATURE_HEADER, "valid")
}

/// Provider whose webhook payloads are `ProviderEvent` JSON
pub struct FakeProvider {
    kind: ProviderKind,
    checkouts: Mutex<HashMap<String, CheckoutState>>,
    revoked: Mutex<Vec<String>>,
    fail_revoke: AtomicBool,
    created: AtomicUsize,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            checkouts: Mutex::new(HashMap::new()),
            revoked: Mutex::new(Vec::new()),
            fail_revoke: AtomicBool::new(false),
            created: AtomicUsize::new(0),
        }
    }

    pub async fn set_checkout(&self, checkout_id: &str, state: CheckoutState) {
        self.checkouts.lock().await.insert(checkout_id.to_string(), state);
    }

    pub async fn revoked(&self) -> Vec<String> {
        self.revoked.lock().await.clone()
    }

    pub fn fail_revokes(&self) {
        self.fail_revoke.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create_grant(&self, principal: &CheckoutPrincipal, plan: PlanTier) -> BillingResult<CheckoutGrant> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let prefix = match principal {
            CheckoutPrincipal::Registered { .. } => "cs_sub",
            CheckoutPrincipal::Anonymous => "cs_anon",
        };
        Ok(CheckoutGrant {
            provider: self.kind,
            provider_object_id: format!("{}_{}", prefix, n),
            redirect_url: format!("https://pay.example.com/{}/{}", plan, n),
        })
    }

    async fn confirm(&self, payload: &str, headers: &SignatureHeaders) -> BillingResult<ProviderEvent> {
        if headers.get(FAKE_SIGNATURE_HEADER) != Some("valid") {
            return Err(BillingError::InvalidSignature);
        }
        let event: ProviderEvent = serde_json::from_str(payload)?;
        if event.provider != self.kind {
            return Err(BillingError::InvalidSignature);
        }
        Ok(event)
    }

    async fn fetch_checkout(&self, checkout_id: &str) -> BillingResult<CheckoutState> {
        self.checkouts
            .lock()
            .await
            .get(checkout_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("checkout {}", checkout_id)))
    }

    async fn revoke(&self, provider_object_id: &str) -> BillingResult<()> {
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err(BillingError::ProviderUnavailable("fake outage".into()));
        }
        self.revoked.lock().await.push(provider_object_id.to_string());
        Ok(())
    }
}

fn event_type_for(kind: &ProviderEventKind) -> String {
    match kind {
        ProviderEventKind::SubscriptionActivated(_) => "customer.subscription.created",
        ProviderEventKind::CheckoutCompleted { .. } => "checkout.session.completed",
        ProviderEventKind::SubscriptionRenewed { .. } => "invoice.payment_succeeded",
        ProviderEventKind::SubscriptionUpdated { .. } => "customer.subscription.updated",
        ProviderEventKind::SubscriptionCancelled { .. } => "customer.subscription.deleted",
        ProviderEventKind::PaymentFailed { .. } => "invoice.payment_failed",
        ProviderEventKind::Unhandled { event_type } => event_type,
    }
    .to_string()
}

/// Fully wired engine over in-memory stores and a fake Stripe
pub struct Fixture {
    pub store: Arc<MemoryBillingStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub provider: Arc<FakeProvider>,
    pub billing: BillingService,
}

impl Fixture {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryBillingStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let provider = Arc::new(FakeProvider::new(ProviderKind::Stripe));
        let providers = ProviderRegistry::new().register(provider.clone());

        let billing = BillingService::new(
            store.clone(),
            notifier.clone(),
            Arc::new(MemoryUsageStore::new()),
            providers,
            TOKEN_SECRET.to_vec(),
        );

        Self {
            store,
            notifier,
            provider,
            billing,
        }
    }

    /// New account on the free plan
    pub async fn user(&self) -> UserId {
        let user = UserId::new();
        self.store
            .create_user(user, Some("someone@example.com"), OffsetDateTime::now_utc())
            .await;
        user
    }

    pub async fn subscription(&self, user: UserId) -> Subscription {
        self.store.load_subscription(user).await.unwrap().unwrap()
    }

    pub fn payload(&self, event_id: &str, kind: ProviderEventKind) -> String {
        self.payload_at(event_id, kind, OffsetDateTime::now_utc())
    }

    pub fn payload_at(&self, event_id: &str, kind: ProviderEventKind, occurred_at: OffsetDateTime) -> String {
        let event = ProviderEvent {
            provider: ProviderKind::Stripe,
            event_id: event_id.to_string(),
            event_type: event_type_for(&kind),
            occurred_at,
            kind,
        };
        serde_json::to_string(&event).unwrap()
    }

    pub fn monthly_outcome(user: Option<UserId>, object_id: &str) -> GrantOutcome {
        let now = OffsetDateTime::now_utc();
        GrantOutcome {
            user_id: user,
            plan: PlanTier::Monthly,
            provider_object_id: object_id.to_string(),
            customer_id: Some(format!("cus_{}", object_id)),
            period_start: Some(now),
            period_end: Some(now + Duration::days(30)),
        }
    }

    /// `customer.subscription.created` for a monthly plan
    pub fn activation_payload(&self, event_id: &str, user: UserId, object_id: &str) -> String {
        self.payload(
            event_id,
            ProviderEventKind::SubscriptionActivated(Self::monthly_outcome(Some(user), object_id)),
        )
    }
}
