//! Subscription record
//!
//! The per-user subscription state embedded on the user row, with its
//! derived flags and the pure state transitions. Transitions take `now`
//! explicitly and return the next record (or `None` when nothing changes);
//! persisting the result is the store's job.

use fixitflow_shared::{PlanTier, ProviderKind, SubscriptionStatus, UserId};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::plans::{PlanCatalog, TRIAL_DAYS, TRIAL_PLAN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: UserId,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::timestamp")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::timestamp::option")]
    pub end_date: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub paypal_subscription_id: Option<String>,
    #[serde(with = "time::serde::timestamp::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    /// Set the first time a trial starts; trials are once per account
    #[serde(with = "time::serde::timestamp::option")]
    pub trial_started_at: Option<OffsetDateTime>,
    /// `provider:object:event` of the last grant that was applied
    pub last_grant_ref: Option<String>,
    #[serde(with = "time::serde::timestamp::option")]
    pub expiry_warning_sent_at: Option<OffsetDateTime>,
    /// Optimistic-lock counter, bumped by the store on every write
    pub version: i64,
}

/// A paid grant as reported by a provider, already authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidGrant {
    pub provider: ProviderKind,
    pub plan: PlanTier,
    pub provider_object_id: String,
    pub customer_id: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    /// Identifies the delivery that produced this grant (event id or checkout id)
    pub grant_ref: String,
    /// When the provider says the grant happened
    pub occurred_at: OffsetDateTime,
}

impl PaidGrant {
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}:{}", self.provider, self.provider_object_id, self.grant_ref)
    }
}

/// What applying a grant to the current record would do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantDecision {
    Apply(Box<Subscription>),
    /// Same grant already applied, or the record already reflects it
    Duplicate,
    /// Grant predates a cancellation of the same provider object
    Stale,
}

impl Subscription {
    /// Record every account starts with
    pub fn default_free(user_id: UserId, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            plan: PlanTier::Free,
            status: SubscriptionStatus::Active,
            start_date: now,
            end_date: None,
            auto_renew: false,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            paypal_subscription_id: None,
            cancelled_at: None,
            trial_started_at: None,
            last_grant_ref: None,
            expiry_warning_sent_at: None,
            version: 0,
        }
    }

    /// Paid plan, active, and inside its term
    pub fn is_premium(&self, now: OffsetDateTime) -> bool {
        self.plan.is_paid()
            && self.status == SubscriptionStatus::Active
            && self.end_date.map_or(true, |end| end > now)
    }

    pub fn is_in_trial(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Trial && self.end_date.is_some_and(|end| end > now)
    }

    pub fn has_premium_access(&self, now: OffsetDateTime) -> bool {
        self.is_premium(now) || self.is_in_trial(now)
    }

    /// Active or trial record whose term has run out
    pub fn is_past_due(&self, now: OffsetDateTime) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        ) && self.end_date.is_some_and(|end| end <= now)
    }

    /// Whole days left in the current term, rounded up
    pub fn days_remaining(&self, now: OffsetDateTime) -> Option<i64> {
        if !self.has_premium_access(now) {
            return None;
        }
        self.end_date.map(|end| {
            let secs = (end - now).whole_seconds();
            (secs + 86_399) / 86_400
        })
    }

    pub fn provider_object_id(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::Stripe => self.stripe_subscription_id.as_deref(),
            ProviderKind::PayPal => self.paypal_subscription_id.as_deref(),
        }
    }

    /// Which provider currently bills this record, if any
    pub fn active_provider(&self) -> Option<(ProviderKind, &str)> {
        if let Some(id) = self.stripe_subscription_id.as_deref() {
            return Some((ProviderKind::Stripe, id));
        }
        self.paypal_subscription_id
            .as_deref()
            .map(|id| (ProviderKind::PayPal, id))
    }

    pub fn start_trial(&self, now: OffsetDateTime) -> BillingResult<Subscription> {
        if self.status == SubscriptionStatus::Trial {
            return Err(BillingError::AlreadyEntitled(
                "A trial is already running".to_string(),
            ));
        }
        if self.is_premium(now) {
            return Err(BillingError::AlreadyEntitled(
                "Account already has a paid plan".to_string(),
            ));
        }
        if self.trial_started_at.is_some() {
            return Err(BillingError::AlreadyEntitled(
                "The free trial has already been used".to_string(),
            ));
        }

        let mut next = self.clone();
        next.plan = TRIAL_PLAN;
        next.status = SubscriptionStatus::Trial;
        next.start_date = now;
        next.end_date = Some(now + Duration::days(TRIAL_DAYS));
        next.trial_started_at = Some(now);
        next.cancelled_at = None;
        next.expiry_warning_sent_at = None;
        Ok(next)
    }

    pub fn grant_paid(&self, grant: &PaidGrant, now: OffsetDateTime) -> BillingResult<GrantDecision> {
        if !grant.plan.is_paid() {
            return Err(BillingError::Validation(format!(
                "Cannot grant non-paid plan '{}'",
                grant.plan
            )));
        }

        let key = grant.dedupe_key();
        if self.last_grant_ref.as_deref() == Some(key.as_str()) {
            return Ok(GrantDecision::Duplicate);
        }

        let same_object =
            self.provider_object_id(grant.provider) == Some(grant.provider_object_id.as_str());

        // A cancelled provider object never comes back; buying again creates
        // a new one.
        if same_object && self.cancelled_at.is_some() {
            return Ok(GrantDecision::Stale);
        }

        let start = grant.period_start.unwrap_or(now);
        let end = match (grant.period_end, PlanCatalog::duration(grant.plan)) {
            (Some(end), _) => end,
            (None, Some(duration)) => start + duration,
            (None, None) => {
                return Err(BillingError::Internal(format!(
                    "Plan '{}' has no duration",
                    grant.plan
                )))
            }
        };
        if end <= start {
            return Err(BillingError::Validation(
                "Grant period must end after it starts".to_string(),
            ));
        }

        if same_object
            && self.status == SubscriptionStatus::Active
            && self.plan == grant.plan
            && self.end_date.is_some_and(|current| current >= end)
        {
            return Ok(GrantDecision::Duplicate);
        }

        let mut next = self.clone();
        next.plan = grant.plan;
        next.status = SubscriptionStatus::Active;
        next.start_date = start;
        next.end_date = Some(end);
        next.auto_renew = true;
        next.cancelled_at = None;
        next.expiry_warning_sent_at = None;
        next.last_grant_ref = Some(key);
        match grant.provider {
            ProviderKind::Stripe => {
                next.stripe_subscription_id = Some(grant.provider_object_id.clone());
                if grant.customer_id.is_some() {
                    next.stripe_customer_id = grant.customer_id.clone();
                }
                next.paypal_subscription_id = None;
            }
            ProviderKind::PayPal => {
                next.paypal_subscription_id = Some(grant.provider_object_id.clone());
                next.stripe_subscription_id = None;
            }
        }
        Ok(GrantDecision::Apply(Box::new(next)))
    }

    /// Extend the current term. `None` when the record already runs at least
    /// that long.
    pub fn renew(&self, new_end: OffsetDateTime) -> BillingResult<Option<Subscription>> {
        if self.status != SubscriptionStatus::Active || !self.plan.is_paid() {
            return Err(BillingError::InvalidState(format!(
                "Cannot renew a subscription that is {} on plan {}",
                self.status, self.plan
            )));
        }
        if new_end <= self.start_date {
            return Err(BillingError::Validation(
                "Renewal must end after the subscription started".to_string(),
            ));
        }
        if self.end_date.is_some_and(|end| end >= new_end) {
            return Ok(None);
        }

        let mut next = self.clone();
        next.end_date = Some(new_end);
        next.expiry_warning_sent_at = None;
        Ok(Some(next))
    }

    /// Immediate cancellation. `None` when there is nothing to cancel.
    pub fn cancel(&self, now: OffsetDateTime) -> Option<Subscription> {
        let cancellable = match self.status {
            SubscriptionStatus::Trial => true,
            SubscriptionStatus::Active => self.plan.is_paid(),
            SubscriptionStatus::Expired | SubscriptionStatus::Cancelled => false,
        };
        if !cancellable {
            return None;
        }

        let mut next = self.clone();
        next.status = SubscriptionStatus::Cancelled;
        next.plan = PlanTier::Free;
        next.end_date = Some(now);
        next.auto_renew = false;
        next.cancelled_at = Some(now);
        Some(next)
    }

    /// Demote a lapsed term. `None` unless the record is past due.
    pub fn expire_if_past_due(&self, now: OffsetDateTime) -> Option<Subscription> {
        if !self.is_past_due(now) {
            return None;
        }
        let mut next = self.clone();
        next.status = SubscriptionStatus::Expired;
        next.plan = PlanTier::Free;
        next.auto_renew = false;
        Some(next)
    }

    pub fn set_auto_renew(&self, enabled: bool) -> Option<Subscription> {
        if self.auto_renew == enabled {
            return None;
        }
        let mut next = self.clone();
        next.auto_renew = enabled;
        Some(next)
    }

    /// Record that the T-minus warning for the current term went out
    pub fn mark_expiry_warned(&self, now: OffsetDateTime) -> Option<Subscription> {
        if self.expiry_warning_sent_at.is_some() || !self.has_premium_access(now) {
            return None;
        }
        let mut next = self.clone();
        next.expiry_warning_sent_at = Some(now);
        Some(next)
    }
}
