//! Subscription invariants
//!
//! Read-only SQL checks over the subscription columns on `users`. They can be
//! run after a webhook replay or a manual fix to confirm the records are
//! still consistent. Each check returns the offending users and a short
//! detail string.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub detail: Option<String>,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access or revenue may be wrong right now
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

struct InvariantCheck {
    name: &'static str,
    description: &'static str,
    severity: ViolationSeverity,
    /// Must select `user_ids UUID[]` and `detail TEXT`
    sql: &'static str,
}

const CHECKS: &[InvariantCheck] = &[
    InvariantCheck {
        name: "trial_has_end_date",
        description: "Trial without an end date never lapses",
        severity: ViolationSeverity::Critical,
        sql: r#"
            SELECT ARRAY[id] AS user_ids, subscription_plan AS detail
            FROM users
            WHERE subscription_status = 'trial' AND subscription_end_date IS NULL
        "#,
    },
    InvariantCheck {
        name: "end_after_start",
        description: "Subscription ends before it starts",
        severity: ViolationSeverity::High,
        sql: r#"
            SELECT ARRAY[id] AS user_ids,
                   subscription_start_date::TEXT || ' > ' || subscription_end_date::TEXT AS detail
            FROM users
            WHERE subscription_end_date IS NOT NULL
              AND subscription_status IN ('active', 'trial')
              AND subscription_end_date <= subscription_start_date
        "#,
    },
    InvariantCheck {
        name: "single_provider_correlation",
        description: "Record is correlated with both Stripe and PayPal",
        severity: ViolationSeverity::Critical,
        sql: r#"
            SELECT ARRAY[id] AS user_ids,
                   stripe_subscription_id || ' / ' || paypal_subscription_id AS detail
            FROM users
            WHERE stripe_subscription_id IS NOT NULL AND paypal_subscription_id IS NOT NULL
        "#,
    },
    InvariantCheck {
        name: "unique_provider_object",
        description: "Provider subscription is attached to more than one user",
        severity: ViolationSeverity::Critical,
        sql: r#"
            SELECT array_agg(id) AS user_ids, 'stripe:' || stripe_subscription_id AS detail
            FROM users
            WHERE stripe_subscription_id IS NOT NULL
            GROUP BY stripe_subscription_id
            HAVING COUNT(*) > 1
            UNION ALL
            SELECT array_agg(id) AS user_ids, 'paypal:' || paypal_subscription_id AS detail
            FROM users
            WHERE paypal_subscription_id IS NOT NULL
            GROUP BY paypal_subscription_id
            HAVING COUNT(*) > 1
        "#,
    },
    InvariantCheck {
        name: "paid_plan_has_correlation",
        description: "Active paid plan with no provider subscription behind it",
        severity: ViolationSeverity::Medium,
        sql: r#"
            SELECT ARRAY[id] AS user_ids, subscription_plan AS detail
            FROM users
            WHERE subscription_status = 'active'
              AND subscription_plan <> 'free'
              AND stripe_subscription_id IS NULL
              AND paypal_subscription_id IS NULL
        "#,
    },
    InvariantCheck {
        name: "stale_active",
        description: "Active or trial record whose term has ended and was not swept",
        severity: ViolationSeverity::Low,
        sql: r#"
            SELECT ARRAY[id] AS user_ids, subscription_end_date::TEXT AS detail
            FROM users
            WHERE subscription_status IN ('active', 'trial')
              AND subscription_end_date < NOW() - INTERVAL '1 hour'
        "#,
    },
];

#[derive(Debug, sqlx::FromRow)]
struct ViolationRow {
    user_ids: Vec<Uuid>,
    detail: Option<String>,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();
        let mut checks_failed = 0;

        for check in CHECKS {
            let found = self.run(check).await?;
            if !found.is_empty() {
                checks_failed += 1;
                tracing::warn!(
                    invariant = check.name,
                    severity = %check.severity,
                    count = found.len(),
                    "Invariant violated"
                );
            }
            violations.extend(found);
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run: CHECKS.len(),
            checks_passed: CHECKS.len() - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        let check = CHECKS
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| BillingError::Validation(format!("Unknown invariant check '{}'", name)))?;
        self.run(check).await
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.iter().map(|c| c.name).collect()
    }

    async fn run(&self, check: &InvariantCheck) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ViolationRow> = sqlx::query_as(check.sql).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: check.name.to_string(),
                user_ids: row.user_ids,
                description: check.description.to_string(),
                detail: row.detail,
                severity: check.severity,
            })
            .collect())
    }
}
