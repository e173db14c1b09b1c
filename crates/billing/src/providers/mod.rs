//! Payment provider adapters
//!
//! Each provider turns its own objects and webhook payloads into the small
//! provider-neutral vocabulary below. Nothing outside this module touches a
//! Stripe or PayPal type.

pub mod paypal;
pub mod stripe;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use fixitflow_shared::{PlanTier, ProviderKind, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::subscription::PaidGrant;

pub use self::paypal::PayPalProvider;
pub use self::stripe::StripeProvider;

/// Who a checkout is for
#[derive(Debug, Clone)]
pub enum CheckoutPrincipal {
    Registered {
        user_id: UserId,
        email: Option<String>,
        stripe_customer_id: Option<String>,
    },
    Anonymous,
}

impl CheckoutPrincipal {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Registered { user_id, .. } => Some(*user_id),
            Self::Anonymous => None,
        }
    }
}

/// A started checkout; nothing is granted until it is confirmed
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutGrant {
    pub provider: ProviderKind,
    pub provider_object_id: String,
    /// Stripe checkout URL or PayPal approval URL
    pub redirect_url: String,
}

/// Authenticated outcome of a paid subscription, as the provider reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantOutcome {
    /// From checkout metadata; `None` when only the provider object is known
    pub user_id: Option<UserId>,
    pub plan: PlanTier,
    pub provider_object_id: String,
    pub customer_id: Option<String>,
    #[serde(with = "time::serde::timestamp::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::timestamp::option")]
    pub period_end: Option<OffsetDateTime>,
}

impl GrantOutcome {
    pub fn into_grant(
        self,
        provider: ProviderKind,
        grant_ref: impl Into<String>,
        occurred_at: OffsetDateTime,
    ) -> PaidGrant {
        PaidGrant {
            provider,
            plan: self.plan,
            provider_object_id: self.provider_object_id,
            customer_id: self.customer_id,
            period_start: self.period_start,
            period_end: self.period_end,
            grant_ref: grant_ref.into(),
            occurred_at,
        }
    }
}

/// What a completed checkout bought
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Purchase {
    Subscription(GrantOutcome),
    Anonymous {
        plan: PlanTier,
        amount_cents: Option<i64>,
        #[serde(with = "time::serde::timestamp")]
        purchased_at: OffsetDateTime,
    },
}

/// Provider-side state of a checkout, re-fetched on the client-reported path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutState {
    Pending,
    Failed(String),
    Completed { checkout_id: String, purchase: Purchase },
}

/// Provider-reported status of a subscription that changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Active,
    PastDue,
    Ended,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEventKind {
    SubscriptionActivated(GrantOutcome),
    CheckoutCompleted {
        checkout_id: String,
        purchase: Purchase,
    },
    SubscriptionRenewed {
        provider_object_id: String,
        #[serde(with = "time::serde::timestamp")]
        period_end: OffsetDateTime,
        amount_cents: Option<i64>,
    },
    SubscriptionUpdated {
        provider_object_id: String,
        status: RemoteStatus,
        #[serde(with = "time::serde::timestamp::option")]
        period_end: Option<OffsetDateTime>,
        cancel_at_period_end: bool,
    },
    SubscriptionCancelled {
        provider_object_id: String,
    },
    PaymentFailed {
        provider_object_id: Option<String>,
        customer_id: Option<String>,
        amount_cents: Option<i64>,
    },
    /// Authentic but not something the engine acts on
    Unhandled {
        event_type: String,
    },
}

/// Normalized, authenticated webhook event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub provider: ProviderKind,
    pub event_id: String,
    /// Provider's own name for the event, kept for logs and the audit table
    pub event_type: String,
    #[serde(with = "time::serde::timestamp")]
    pub occurred_at: OffsetDateTime,
    pub kind: ProviderEventKind,
}

/// Webhook headers with lower-cased names
#[derive(Debug, Clone, Default)]
pub struct SignatureHeaders(BTreeMap<String, String>);

impl SignatureHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn require(&self, name: &str) -> BillingResult<&str> {
        self.get(name).ok_or_else(|| {
            tracing::warn!(header = %name, "Webhook missing signature header");
            BillingError::InvalidSignature
        })
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for SignatureHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name.as_ref(), value);
        }
        headers
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Start a checkout for `plan`. Does not grant anything.
    async fn create_grant(
        &self,
        principal: &CheckoutPrincipal,
        plan: PlanTier,
    ) -> BillingResult<CheckoutGrant>;

    /// Authenticate a webhook delivery and translate it
    async fn confirm(&self, payload: &str, headers: &SignatureHeaders) -> BillingResult<ProviderEvent>;

    /// Re-read a checkout from the provider
    async fn fetch_checkout(&self, checkout_id: &str) -> BillingResult<CheckoutState>;

    /// Cancel the provider-side subscription, best effort
    async fn revoke(&self, provider_object_id: &str) -> BillingResult<()>;
}

/// Configured providers, selected by `ProviderKind`
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Every provider whose credentials are present in the environment
    pub fn from_env() -> Self {
        let mut registry = Self::new();

        match crate::client::StripeClient::from_env() {
            Ok(client) => registry = registry.register(Arc::new(StripeProvider::new(client))),
            Err(e) => tracing::warn!(error = %e, "Stripe not configured"),
        }
        match crate::client::PayPalConfig::from_env() {
            Ok(config) => registry = registry.register(Arc::new(PayPalProvider::new(config))),
            Err(e) => tracing::warn!(error = %e, "PayPal not configured"),
        }

        registry
    }

    pub fn get(&self, kind: ProviderKind) -> BillingResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| BillingError::Validation(format!("Payment provider '{}' is not enabled", kind)))
    }

    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Bound a provider call by `timeout`, mapping expiry to `ProviderUnavailable`
pub(crate) async fn with_timeout<T, F>(
    provider: ProviderKind,
    timeout: std::time::Duration,
    fut: F,
) -> BillingResult<T>
where
    F: std::future::Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(provider = %provider, timeout_ms = timeout.as_millis() as u64, "Provider call timed out");
            Err(BillingError::ProviderUnavailable(format!(
                "{} did not respond within {}s",
                provider,
                timeout.as_secs()
            )))
        }
    }
}
