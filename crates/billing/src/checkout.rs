//! Checkout flows
//!
//! `start` asks a provider for a checkout and grants nothing. `complete` is
//! the client-reported success path: it never trusts the caller beyond the
//! checkout id, re-reads the checkout from the provider, and applies the
//! grant with the checkout id as its reference so the later webhook is a
//! no-op.

use std::sync::Arc;

use fixitflow_shared::{PlanTier, ProviderKind, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::entitlement::EntitlementService;
use crate::error::{BillingError, BillingResult};
use crate::providers::{CheckoutGrant, CheckoutPrincipal, CheckoutState, ProviderRegistry, Purchase};
use crate::store::BillingStore;
use crate::subscription::Subscription;
use crate::subscriptions::SubscriptionService;
use crate::token::AnonymousToken;

/// Outcome of the client-reported success path
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutCompletion {
    /// Provider has not settled the payment yet; the webhook will finish it
    Pending,
    Failed {
        reason: String,
    },
    Subscribed {
        subscription: Box<Subscription>,
        /// `false` when the webhook (or an earlier call) already applied it
        newly_applied: bool,
    },
    AnonymousToken {
        token: String,
        plan: PlanTier,
        #[serde(with = "time::serde::timestamp")]
        expires_at: OffsetDateTime,
    },
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionService,
    entitlements: EntitlementService,
    providers: Arc<ProviderRegistry>,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        subscriptions: SubscriptionService,
        entitlements: EntitlementService,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            subscriptions,
            entitlements,
            providers,
        }
    }

    /// Start a checkout. `user_id` is `None` for anonymous buyers.
    pub async fn start(
        &self,
        user_id: Option<UserId>,
        plan: PlanTier,
        provider: ProviderKind,
    ) -> BillingResult<CheckoutGrant> {
        if !plan.is_paid() {
            return Err(BillingError::Validation(format!(
                "Plan '{}' cannot be purchased",
                plan
            )));
        }
        let adapter = self.providers.get(provider)?;

        let principal = match user_id {
            Some(user_id) => {
                let sub = self.subscriptions.get(user_id).await?;
                if sub.is_premium(OffsetDateTime::now_utc()) {
                    return Err(BillingError::AlreadyEntitled(format!(
                        "Account already has an active {} plan",
                        sub.plan
                    )));
                }
                CheckoutPrincipal::Registered {
                    user_id,
                    email: self.store.user_email(user_id).await?,
                    stripe_customer_id: sub.stripe_customer_id.clone(),
                }
            }
            None => CheckoutPrincipal::Anonymous,
        };

        let grant = adapter.create_grant(&principal, plan).await?;
        tracing::info!(
            user_id = ?user_id,
            provider = %provider,
            plan = %plan,
            provider_object_id = %grant.provider_object_id,
            "Checkout started"
        );
        Ok(grant)
    }

    /// Re-derive a checkout's result from the provider and apply it
    pub async fn complete(
        &self,
        user_id: Option<UserId>,
        provider: ProviderKind,
        checkout_id: &str,
    ) -> BillingResult<CheckoutCompletion> {
        if checkout_id.trim().is_empty() {
            return Err(BillingError::Validation("checkout id is required".to_string()));
        }
        let adapter = self.providers.get(provider)?;

        let (checkout_id, purchase) = match adapter.fetch_checkout(checkout_id).await? {
            CheckoutState::Pending => {
                tracing::info!(checkout_id = %checkout_id, provider = %provider, "Checkout not settled yet");
                return Ok(CheckoutCompletion::Pending);
            }
            CheckoutState::Failed(reason) => {
                tracing::info!(checkout_id = %checkout_id, provider = %provider, reason = %reason, "Checkout failed");
                return Ok(CheckoutCompletion::Failed { reason });
            }
            CheckoutState::Completed {
                checkout_id,
                purchase,
            } => (checkout_id, purchase),
        };

        match purchase {
            Purchase::Subscription(outcome) => {
                let Some(user_id) = user_id else {
                    return Err(BillingError::Validation(
                        "Sign in to complete a subscription checkout".to_string(),
                    ));
                };
                // Unattributed checkouts can't be claimed; the webhook path
                // correlates those by customer instead.
                if outcome.user_id != Some(user_id) {
                    tracing::warn!(
                        user_id = %user_id,
                        owner = ?outcome.user_id,
                        checkout_id = %checkout_id,
                        "Checkout completion attempted by a different account"
                    );
                    return Err(BillingError::Validation(
                        "Checkout belongs to a different account".to_string(),
                    ));
                }

                // Stamp with the provider's own term start so a re-read of an old
                // checkout can't look newer than a later cancel.
                let occurred_at = outcome.period_start.unwrap_or_else(OffsetDateTime::now_utc);
                let grant = outcome.into_grant(provider, checkout_id, occurred_at);
                let change = self.subscriptions.grant_paid(user_id, &grant).await?;
                Ok(CheckoutCompletion::Subscribed {
                    newly_applied: change.is_applied(),
                    subscription: Box::new(change.into_subscription()),
                })
            }
            Purchase::Anonymous {
                plan, purchased_at, ..
            } => {
                let token = AnonymousToken::for_purchase(plan, checkout_id.as_str(), purchased_at)?;
                let encoded = self.entitlements.issue_token(&token)?;
                tracing::info!(checkout_id = %checkout_id, plan = %plan, "Issued anonymous entitlement token");
                Ok(CheckoutCompletion::AnonymousToken {
                    token: encoded,
                    plan,
                    expires_at: token.expires_at,
                })
            }
        }
    }
}
