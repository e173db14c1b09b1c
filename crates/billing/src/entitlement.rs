//! Entitlement decisions
//!
//! `EntitlementEvaluator` is pure: given a subscription record (or an
//! anonymous token) and today's usage it decides whether a capability may
//! be used. `EntitlementService` does the I/O around it: it loads the record,
//! demotes lapsed terms before deciding, and reads or bumps usage counters.
//!
//! "Not entitled" is a normal `Decision`, never an error.

use std::sync::Arc;

use fixitflow_shared::{Capability, PlanTier, SubscriptionStatus, UserId};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::plans::PlanCatalog;
use crate::subscription::Subscription;
use crate::subscriptions::SubscriptionService;
use crate::token::AnonymousToken;
use crate::usage::{ttl_for_day, usage_key, UsageStore};

/// Who is asking
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Registered { user_id: UserId },
    /// Holder of an anonymous entitlement token, as presented
    Anonymous { token: String },
    /// Neither logged in nor holding a token
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Plan,
    Trial,
    AnonymousToken,
    FreeQuota,
    QuotaExhausted,
    UpgradeRequired,
    UnknownCapability,
    TokenExpired,
    TokenInvalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub capability: String,
    pub allowed: bool,
    pub reason: DecisionReason,
    /// Free-tier uses left today, when the quota path decided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_today: Option<u32>,
}

impl Decision {
    fn allow(capability: &str, reason: DecisionReason) -> Self {
        Self {
            capability: capability.to_string(),
            allowed: true,
            reason,
            remaining_today: None,
        }
    }

    fn deny(capability: &str, reason: DecisionReason) -> Self {
        Self {
            capability: capability.to_string(),
            allowed: false,
            reason,
            remaining_today: None,
        }
    }

    fn quota(capability: &str, limit: u32, used: u32) -> Self {
        let remaining = limit.saturating_sub(used);
        Self {
            capability: capability.to_string(),
            allowed: used < limit,
            reason: if used < limit {
                DecisionReason::FreeQuota
            } else {
                DecisionReason::QuotaExhausted
            },
            remaining_today: Some(remaining),
        }
    }
}

/// Pure entitlement rules
pub struct EntitlementEvaluator;

impl EntitlementEvaluator {
    /// Capability granted by the record's plan right now, if any
    pub fn covered_by_plan(sub: &Subscription, capability: Capability, now: OffsetDateTime) -> Option<DecisionReason> {
        if !sub.has_premium_access(now) || !PlanCatalog::includes(sub.plan, capability) {
            return None;
        }
        Some(if sub.status == SubscriptionStatus::Trial {
            DecisionReason::Trial
        } else {
            DecisionReason::Plan
        })
    }

    /// Decide for a registered user. `usage_today` is the number of times the
    /// capability was already used today; only the free quota path reads it.
    pub fn evaluate(sub: &Subscription, capability: &str, now: OffsetDateTime, usage_today: u32) -> Decision {
        let Ok(cap) = capability.parse::<Capability>() else {
            return Decision::deny(capability, DecisionReason::UnknownCapability);
        };

        if let Some(reason) = Self::covered_by_plan(sub, cap, now) {
            return Decision::allow(capability, reason);
        }

        match PlanCatalog::free_daily_allowance(cap) {
            Some(limit) => Decision::quota(capability, limit, usage_today),
            None => Decision::deny(capability, DecisionReason::UpgradeRequired),
        }
    }

    /// Decide for an anonymous token holder. Any decode failure denies.
    pub fn evaluate_token(token: &str, capability: &str, now: OffsetDateTime, secret: &[u8]) -> Decision {
        let Ok(cap) = capability.parse::<Capability>() else {
            return Decision::deny(capability, DecisionReason::UnknownCapability);
        };

        let token = match AnonymousToken::decode(token, secret) {
            Ok(token) => token,
            Err(e) => {
                tracing::debug!(error = %e, "Rejecting undecodable entitlement token");
                return Decision::deny(capability, DecisionReason::TokenInvalid);
            }
        };

        if token.is_expired(now) {
            Decision::deny(capability, DecisionReason::TokenExpired)
        } else if token.allows(cap, now) {
            Decision::allow(capability, DecisionReason::AnonymousToken)
        } else {
            Decision::deny(capability, DecisionReason::UpgradeRequired)
        }
    }

    /// Guests get nothing; the free quota needs an account to count against
    pub fn evaluate_guest(capability: &str) -> Decision {
        match capability.parse::<Capability>() {
            Ok(_) => Decision::deny(capability, DecisionReason::UpgradeRequired),
            Err(_) => Decision::deny(capability, DecisionReason::UnknownCapability),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AllowanceStatus {
    pub capability: Capability,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
}

/// What a user currently has, for the account page
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementSummary {
    pub user_id: UserId,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::timestamp::option")]
    pub end_date: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub is_premium: bool,
    pub is_in_trial: bool,
    pub has_premium_access: bool,
    pub days_remaining: Option<i64>,
    pub trial_available: bool,
    pub capabilities: Vec<Capability>,
    pub free_allowances: Vec<AllowanceStatus>,
}

/// Result of checking an anonymous token
#[derive(Debug, Clone, Serialize)]
pub struct TokenVerification {
    pub valid: bool,
    pub expired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanTier>,
    #[serde(with = "time::serde::timestamp::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub remaining_features: Vec<Capability>,
}

#[derive(Clone)]
pub struct EntitlementService {
    subscriptions: SubscriptionService,
    usage: Arc<dyn UsageStore>,
    token_secret: Arc<Vec<u8>>,
}

impl EntitlementService {
    pub fn new(subscriptions: SubscriptionService, usage: Arc<dyn UsageStore>, token_secret: Vec<u8>) -> Self {
        Self {
            subscriptions,
            usage,
            token_secret: Arc::new(token_secret),
        }
    }

    /// Load the record, demoting it first if its term has lapsed
    async fn current(&self, user_id: UserId, now: OffsetDateTime) -> BillingResult<Subscription> {
        let sub = self.subscriptions.get(user_id).await?;
        if !sub.is_past_due(now) {
            return Ok(sub);
        }

        match self.subscriptions.expire_if_past_due(user_id, now).await {
            Ok(change) => Ok(change.into_subscription()),
            Err(e) => {
                // Derived flags already treat a lapsed term as non-premium
                tracing::warn!(user_id = %user_id, error = %e, "Inline expiry failed");
                Ok(sub)
            }
        }
    }

    async fn usage_today(&self, user_id: UserId, capability: Capability, now: OffsetDateTime) -> BillingResult<u32> {
        self.usage.get(&usage_key(user_id, capability, now)).await
    }

    pub async fn can_use(&self, principal: &Principal, capability: &str) -> BillingResult<Decision> {
        let now = OffsetDateTime::now_utc();
        let decision = match principal {
            Principal::Registered { user_id } => {
                let sub = self.current(*user_id, now).await?;
                let used = match capability.parse::<Capability>() {
                    Ok(cap)
                        if EntitlementEvaluator::covered_by_plan(&sub, cap, now).is_none()
                            && PlanCatalog::free_daily_allowance(cap).is_some() =>
                    {
                        self.usage_today(*user_id, cap, now).await?
                    }
                    _ => 0,
                };
                EntitlementEvaluator::evaluate(&sub, capability, now, used)
            }
            Principal::Anonymous { token } => {
                EntitlementEvaluator::evaluate_token(token, capability, now, &self.token_secret)
            }
            Principal::Guest => EntitlementEvaluator::evaluate_guest(capability),
        };

        tracing::debug!(
            capability = %capability,
            allowed = decision.allowed,
            reason = ?decision.reason,
            "Entitlement decision"
        );
        Ok(decision)
    }

    /// Consume one use of `capability`. Plan-covered capabilities are not
    /// counted; free-tier ones are incremented first and then compared, so
    /// concurrent callers cannot both take the last unit.
    pub async fn record_usage(&self, user_id: UserId, capability: &str) -> BillingResult<Decision> {
        let now = OffsetDateTime::now_utc();
        let Ok(cap) = capability.parse::<Capability>() else {
            return Ok(Decision::deny(capability, DecisionReason::UnknownCapability));
        };

        let sub = self.current(user_id, now).await?;
        if let Some(reason) = EntitlementEvaluator::covered_by_plan(&sub, cap, now) {
            return Ok(Decision::allow(capability, reason));
        }

        let Some(limit) = PlanCatalog::free_daily_allowance(cap) else {
            return Ok(Decision::deny(capability, DecisionReason::UpgradeRequired));
        };

        let count = self
            .usage
            .increment(&usage_key(user_id, cap, now), ttl_for_day(now))
            .await?;

        // `count` includes this use
        let decision = Decision::quota(capability, limit, count.saturating_sub(1));
        if !decision.allowed {
            tracing::info!(user_id = %user_id, capability = %cap, limit = limit, "Free quota exhausted");
        }
        Ok(Decision {
            remaining_today: Some(limit.saturating_sub(count)),
            ..decision
        })
    }

    pub async fn status(&self, user_id: UserId) -> BillingResult<EntitlementSummary> {
        let now = OffsetDateTime::now_utc();
        let sub = self.current(user_id, now).await?;

        let capabilities: Vec<Capability> = if sub.has_premium_access(now) {
            PlanCatalog::capabilities(sub.plan).to_vec()
        } else {
            Vec::new()
        };

        let mut free_allowances = Vec::new();
        for (capability, limit) in PlanCatalog::free_allowances() {
            if capabilities.contains(capability) {
                continue;
            }
            let used = self.usage_today(user_id, *capability, now).await?;
            free_allowances.push(AllowanceStatus {
                capability: *capability,
                limit: *limit,
                used,
                remaining: limit.saturating_sub(used),
            });
        }

        Ok(EntitlementSummary {
            user_id,
            plan: sub.plan,
            status: sub.status,
            end_date: sub.end_date,
            auto_renew: sub.auto_renew,
            is_premium: sub.is_premium(now),
            is_in_trial: sub.is_in_trial(now),
            has_premium_access: sub.has_premium_access(now),
            days_remaining: sub.days_remaining(now),
            trial_available: sub.trial_started_at.is_none() && !sub.has_premium_access(now),
            capabilities,
            free_allowances,
        })
    }

    pub fn verify_token(&self, token: &str) -> TokenVerification {
        let now = OffsetDateTime::now_utc();
        match AnonymousToken::decode(token, &self.token_secret) {
            Ok(token) => TokenVerification {
                valid: !token.is_expired(now),
                expired: token.is_expired(now),
                plan: Some(token.plan),
                expires_at: Some(token.expires_at),
                remaining_features: token.remaining_features(now).to_vec(),
            },
            Err(e) => {
                tracing::debug!(error = %e, "Token verification failed");
                TokenVerification {
                    valid: false,
                    expired: false,
                    plan: None,
                    expires_at: None,
                    remaining_features: Vec::new(),
                }
            }
        }
    }

    /// Sign a token for a completed anonymous purchase
    pub fn issue_token(&self, token: &AnonymousToken) -> BillingResult<String> {
        token.encode(&self.token_secret)
    }
}
