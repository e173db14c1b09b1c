//! Admin routes
//!
//! Support tooling for billing: inspect and replay webhook deliveries, run
//! the invariant checks, trigger a sweep, and read a user's raw record.
//! Protected by `require_auth` + `require_admin`.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use fixitflow_billing::{
    sweeper::DEFAULT_SWEEP_BATCH, InvariantCheckSummary, InvariantViolation, Subscription,
    SweepReport, WebhookEventRecord, WebhookReplayResult,
};
use fixitflow_shared::{ProviderKind, UserId};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/admin/webhooks
pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    let billing = state.billing()?;
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    let events = billing
        .webhooks
        .list_webhooks(query.status.as_deref(), limit, offset)
        .await?;
    Ok(Json(events))
}

/// POST /api/v1/admin/webhooks/{provider}/{event_id}/replay
pub async fn replay_webhook(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path((provider, event_id)): Path<(String, String)>,
) -> ApiResult<Json<WebhookReplayResult>> {
    let billing = state.billing()?;
    let provider: ProviderKind = provider.parse().map_err(ApiError::Validation)?;

    tracing::info!(
        admin_id = %auth_user.user_id,
        provider = %provider,
        event_id = %event_id,
        "Admin replaying webhook"
    );
    Ok(Json(billing.webhooks.replay(provider, &event_id).await?))
}

/// POST /api/v1/admin/webhooks/replay-failed
pub async fn replay_failed(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ReplayFailedQuery>,
) -> ApiResult<Json<Vec<WebhookReplayResult>>> {
    let billing = state.billing()?;
    let limit = query.limit.unwrap_or(25).clamp(1, 100);

    let results = billing.webhooks.replay_all_failed(limit).await?;
    tracing::info!(
        admin_id = %auth_user.user_id,
        replayed = results.len(),
        succeeded = results.iter().filter(|r| r.success).count(),
        "Admin replayed failed webhooks"
    );
    Ok(Json(results))
}

/// GET /api/v1/admin/invariants
pub async fn run_invariants(State(state): State<AppState>) -> ApiResult<Json<InvariantCheckSummary>> {
    Ok(Json(state.invariants()?.run_all_checks().await?))
}

/// GET /api/v1/admin/invariants/{name}
pub async fn run_invariant(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<InvariantViolation>>> {
    Ok(Json(state.invariants()?.run_check(&name).await?))
}

/// POST /api/v1/admin/sweep
pub async fn run_sweep(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SweepReport>> {
    let billing = state.billing()?;
    tracing::info!(admin_id = %auth_user.user_id, "Admin triggered expiry sweep");
    let report = billing
        .sweeper
        .sweep_expired(OffsetDateTime::now_utc(), DEFAULT_SWEEP_BATCH)
        .await?;
    Ok(Json(report))
}

/// GET /api/v1/admin/users/{user_id}/subscription
pub async fn get_user_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<Subscription>> {
    let billing = state.billing()?;
    Ok(Json(billing.subscriptions.get(UserId(user_id)).await?))
}
