//! Postgres-backed `BillingStore`
//!
//! The subscription record lives in columns on `users`; writes are
//! compare-and-swap on `subscription_version`. Webhook claims use a single
//! `INSERT ... ON CONFLICT ... DO UPDATE ... WHERE ... RETURNING` so exactly
//! one concurrent delivery wins.

use async_trait::async_trait;
use fixitflow_shared::{ProviderKind, UserId};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::store::{
    BillingStore, WebhookClaim, WebhookEventRecord, WebhookProcessingResult, PROCESSING_TIMEOUT_MINUTES,
};
use crate::subscription::Subscription;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, subscription_plan, subscription_status, subscription_start_date, subscription_end_date,
    auto_renew, stripe_customer_id, stripe_subscription_id, paypal_subscription_id,
    subscription_cancelled_at, trial_started_at, last_grant_ref, expiry_warning_sent_at,
    subscription_version
"#;

const WEBHOOK_COLUMNS: &str = r#"
    id, provider, event_id, event_type, event_timestamp, payload, processing_result,
    processing_started_at, error_message, attempts, created_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    subscription_plan: String,
    subscription_status: String,
    subscription_start_date: OffsetDateTime,
    subscription_end_date: Option<OffsetDateTime>,
    auto_renew: bool,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    paypal_subscription_id: Option<String>,
    subscription_cancelled_at: Option<OffsetDateTime>,
    trial_started_at: Option<OffsetDateTime>,
    last_grant_ref: Option<String>,
    expiry_warning_sent_at: Option<OffsetDateTime>,
    subscription_version: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        // Plan parsing also accepts the legacy 'premium' value
        let plan = row.subscription_plan.parse().map_err(BillingError::Database)?;
        let status = row.subscription_status.parse().map_err(BillingError::Database)?;
        Ok(Subscription {
            user_id: UserId(row.id),
            plan,
            status,
            start_date: row.subscription_start_date,
            end_date: row.subscription_end_date,
            auto_renew: row.auto_renew,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            paypal_subscription_id: row.paypal_subscription_id,
            cancelled_at: row.subscription_cancelled_at,
            trial_started_at: row.trial_started_at,
            last_grant_ref: row.last_grant_ref,
            expiry_warning_sent_at: row.expiry_warning_sent_at,
            version: row.subscription_version,
        })
    }
}

fn into_subscriptions(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<Subscription>> {
    rows.into_iter().map(Subscription::try_from).collect()
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_one(&self, filter: &str, value: &str) -> BillingResult<Option<Subscription>> {
        let sql = format!("SELECT {} FROM users WHERE {} = $1 LIMIT 1", SUBSCRIPTION_COLUMNS, filter);
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn load_subscription(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", SUBSCRIPTION_COLUMNS);
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn find_by_provider_object(
        &self,
        provider: ProviderKind,
        object_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let column = match provider {
            ProviderKind::Stripe => "stripe_subscription_id",
            ProviderKind::PayPal => "paypal_subscription_id",
        };
        self.find_one(column, object_id).await
    }

    async fn find_by_stripe_customer(&self, customer_id: &str) -> BillingResult<Option<Subscription>> {
        self.find_one("stripe_customer_id", customer_id).await
    }

    async fn compare_and_swap(&self, expected_version: i64, next: &Subscription) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users SET
                subscription_plan = $3,
                subscription_status = $4,
                subscription_start_date = $5,
                subscription_end_date = $6,
                auto_renew = $7,
                stripe_customer_id = $8,
                stripe_subscription_id = $9,
                paypal_subscription_id = $10,
                subscription_cancelled_at = $11,
                trial_started_at = $12,
                last_grant_ref = $13,
                expiry_warning_sent_at = $14,
                subscription_version = subscription_version + 1
            WHERE id = $1 AND subscription_version = $2
            "#,
        )
        .bind(next.user_id.0)
        .bind(expected_version)
        .bind(next.plan.as_str())
        .bind(next.status.as_str())
        .bind(next.start_date)
        .bind(next.end_date)
        .bind(next.auto_renew)
        .bind(&next.stripe_customer_id)
        .bind(&next.stripe_subscription_id)
        .bind(&next.paypal_subscription_id)
        .bind(next.cancelled_at)
        .bind(next.trial_started_at)
        .bind(&next.last_grant_ref)
        .bind(next.expiry_warning_sent_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(next.user_id.0)
            .fetch_one(&self.pool)
            .await?;
        if !exists.0 {
            return Err(BillingError::NotFound(format!("user {}", next.user_id)));
        }
        Ok(false)
    }

    async fn list_past_due(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {} FROM users
            WHERE subscription_status IN ('active', 'trial')
              AND subscription_end_date IS NOT NULL
              AND subscription_end_date <= $1
            ORDER BY subscription_end_date
            LIMIT $2
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        into_subscriptions(rows)
    }

    async fn list_expiring(
        &self,
        from: OffsetDateTime,
        to: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {} FROM users
            WHERE subscription_status IN ('active', 'trial')
              AND expiry_warning_sent_at IS NULL
              AND subscription_end_date > $1
              AND subscription_end_date <= $2
            ORDER BY subscription_end_date
            LIMIT $3
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(from)
            .bind(to)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        into_subscriptions(rows)
    }

    async fn user_email(&self, user_id: UserId) -> BillingResult<Option<String>> {
        let email: Option<(Option<String>,)> = sqlx::query_as("SELECT email FROM users WHERE id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(email.and_then(|(email,)| email))
    }

    async fn claim_webhook_event(&self, claim: &WebhookClaim) -> BillingResult<bool> {
        // New rows are claimed outright. Existing rows are re-claimed only if
        // the last attempt failed or has been stuck in 'processing' or
        // 'replaying' too long.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider, event_id, event_type, event_timestamp, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, $5, 'processing', NOW())
            ON CONFLICT (provider, event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                payload = EXCLUDED.payload,
                attempts = webhook_events.attempts + 1
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result IN ('processing', 'replaying')
                   AND webhook_events.processing_started_at < NOW() - make_interval(mins => $6))
            RETURNING id
            "#,
        )
        .bind(claim.provider)
        .bind(&claim.event_id)
        .bind(&claim.event_type)
        .bind(claim.event_timestamp)
        .bind(&claim.payload)
        .bind(PROCESSING_TIMEOUT_MINUTES as i32)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn complete_webhook_event(
        &self,
        provider: ProviderKind,
        event_id: &str,
        result: WebhookProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $3, error_message = $4, processed_at = NOW()
            WHERE provider = $1 AND event_id = $2
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .bind(result.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_event(
        &self,
        provider: ProviderKind,
        event_id: &str,
    ) -> BillingResult<Option<WebhookEventRecord>> {
        let sql = format!(
            "SELECT {} FROM webhook_events WHERE provider = $1 AND event_id = $2",
            WEBHOOK_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(provider)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn begin_webhook_replay(&self, provider: ProviderKind, event_id: &str) -> BillingResult<bool> {
        let started: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET processing_result = 'replaying',
                processing_started_at = NOW(),
                attempts = attempts + 1
            WHERE provider = $1 AND event_id = $2
              AND processing_result = 'error'
            RETURNING id
            "#,
        )
        .bind(provider)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(started.is_some())
    }

    async fn list_webhook_events(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE ($1::TEXT IS NULL OR processing_result = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
            WEBHOOK_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(status_filter)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn delete_webhook_events_before(&self, cutoff: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM webhook_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_billing_event(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (id, user_id, event_type, actor_type, provider, provider_event_id, amount_cents, event_data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.user_id.map(|u| u.0))
        .bind(event.event_type.as_str())
        .bind(event.actor_type.as_str())
        .bind(event.provider)
        .bind(&event.provider_event_id)
        .bind(event.amount_cents)
        .bind(&event.data)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
