// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
#![allow(clippy::too_many_arguments)] // Provider request builders take many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! FixItFlow Billing Module
//!
//! Premium entitlements and the subscription lifecycle behind them.
//!
//! ## Features
//!
//! - **Plans**: One canonical plan table with prices, durations and capabilities
//! - **Entitlements**: Request-time `can_use` for users, anonymous token holders and guests
//! - **Free Allowances**: Daily per-capability quotas for free accounts
//! - **Subscriptions**: Trial, grant, renew, cancel and expiry as versioned transitions
//! - **Providers**: Stripe and PayPal behind one `PaymentProvider` trait
//! - **Webhooks**: Signature-checked, deduplicated reconciliation with replay
//! - **Anonymous Tokens**: HMAC-signed, stateless time-boxed access
//! - **Sweeper**: Expiry demotion and T-3 day warnings
//! - **Notifications**: Email and in-app, never blocking a transition
//! - **Audit**: Append-only billing event log and SQL invariant checks

pub mod checkout;
pub mod client;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod invariants;
pub mod notify;
pub mod pg_store;
pub mod plans;
pub mod providers;
pub mod store;
pub mod subscription;
pub mod subscriptions;
pub mod sweeper;
pub mod token;
pub mod usage;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

// Checkout
pub use checkout::{CheckoutCompletion, CheckoutService};

// Client
pub use client::{PayPalConfig, PriceIds, StripeClient, StripeConfig};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Entitlement
pub use entitlement::{
    Decision, DecisionReason, EntitlementEvaluator, EntitlementService, EntitlementSummary,
    Principal, TokenVerification,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notify::{Notification, NotificationHub, NotificationTemplate, Notifier};

// Plans
pub use plans::{PlanCatalog, PlanDefinition};

// Providers
pub use providers::{
    CheckoutGrant, PaymentProvider, PayPalProvider, ProviderEvent, ProviderRegistry,
    SignatureHeaders, StripeProvider,
};

// Store
pub use pg_store::PgBillingStore;
pub use store::{BillingStore, MemoryBillingStore, WebhookEventRecord};

// Subscriptions
pub use subscription::{PaidGrant, Subscription};
pub use subscriptions::{Change, Origin, SubscriptionService};

// Sweeper
pub use sweeper::{LifecycleSweeper, SweepReport, WarningReport, EXPIRY_WARNING_DAYS};

// Token
pub use token::AnonymousToken;

// Usage
pub use usage::{MemoryUsageStore, RedisUsageStore, UsageStore};

// Webhooks
pub use webhooks::{Disposition, WebhookOutcome, WebhookReconciler, WebhookReplayResult};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn BillingStore>,
    pub providers: Arc<ProviderRegistry>,
    pub subscriptions: SubscriptionService,
    pub entitlements: EntitlementService,
    pub checkout: CheckoutService,
    pub webhooks: WebhookReconciler,
    pub sweeper: LifecycleSweeper,
}

impl BillingService {
    /// Create a billing service over Postgres with providers and email from
    /// environment variables. Unconfigured providers are left out.
    pub fn from_env(pool: PgPool, usage: Arc<dyn UsageStore>, token_secret: Vec<u8>) -> BillingResult<Self> {
        if token_secret.is_empty() {
            return Err(BillingError::Config("token signing secret must not be empty".to_string()));
        }

        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));
        let email = BillingEmailService::from_env();
        if email.is_none() {
            tracing::warn!("Email not configured; billing notifications are in-app only");
        }
        let notifier = Arc::new(NotificationHub::new(Arc::clone(&store), email));
        let providers = ProviderRegistry::from_env();
        if providers.is_empty() {
            tracing::warn!("No payment provider configured; checkout is disabled");
        }

        Ok(Self::new(store, notifier, usage, providers, token_secret))
    }

    /// Create a billing service from explicit parts
    pub fn new(
        store: Arc<dyn BillingStore>,
        notifier: Arc<dyn Notifier>,
        usage: Arc<dyn UsageStore>,
        providers: ProviderRegistry,
        token_secret: Vec<u8>,
    ) -> Self {
        let providers = Arc::new(providers);
        let subscriptions =
            SubscriptionService::new(Arc::clone(&store), Arc::clone(&notifier), Arc::clone(&providers));
        let entitlements = EntitlementService::new(subscriptions.clone(), usage, token_secret);

        Self {
            checkout: CheckoutService::new(
                Arc::clone(&store),
                subscriptions.clone(),
                entitlements.clone(),
                Arc::clone(&providers),
            ),
            webhooks: WebhookReconciler::new(
                Arc::clone(&store),
                subscriptions.clone(),
                Arc::clone(&providers),
            ),
            sweeper: LifecycleSweeper::new(Arc::clone(&store), subscriptions.clone(), notifier),
            entitlements,
            subscriptions,
            providers,
            store,
        }
    }
}
