//! Billing routes
//!
//! Plans, trial, checkout, cancellation, and entitlement queries under
//! `/api/v1/billing`. Every state change goes through the billing crate's
//! services; handlers only translate between HTTP and those calls.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use fixitflow_billing::{
    plans::TRIAL_DAYS, CheckoutCompletion, Decision, EntitlementSummary, Origin, PlanCatalog,
    PlanDefinition, Subscription, TokenVerification,
};
use fixitflow_shared::{Capability, PlanTier, ProviderKind, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    auth::{AuthUser, MaybeAuthUser, RequestPrincipal},
    error::{ApiError, ApiResult},
    routes::gate::denial,
    state::AppState,
};

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct FreeAllowance {
    pub capability: Capability,
    pub daily_limit: u32,
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: &'static [PlanDefinition],
    pub free_allowances: Vec<FreeAllowance>,
    pub trial_days: i64,
    /// Providers that can take payments right now
    pub providers: Vec<ProviderKind>,
}

/// Account-facing view of a subscription record
#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::timestamp")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::timestamp::option")]
    pub end_date: Option<OffsetDateTime>,
    pub auto_renew: bool,
    pub is_in_trial: bool,
    pub has_premium_access: bool,
    pub days_remaining: Option<i64>,
    pub provider: Option<ProviderKind>,
}

impl SubscriptionView {
    pub fn new(sub: &Subscription) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            plan: sub.plan,
            status: sub.status,
            start_date: sub.start_date,
            end_date: sub.end_date,
            auto_renew: sub.auto_renew,
            is_in_trial: sub.is_in_trial(now),
            has_premium_access: sub.has_premium_access(now),
            days_remaining: sub.days_remaining(now),
            provider: sub.active_provider().map(|(kind, _)| kind),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub provider: ProviderKind,
    pub checkout_id: String,
    pub url: String,
}

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: String,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentSuccessRequest {
    #[serde(alias = "session_id", alias = "subscription_id")]
    pub checkout_id: String,
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AutoRenewRequest {
    pub enabled: bool,
}

fn parse_provider(provider: Option<&str>) -> ApiResult<ProviderKind> {
    provider
        .map(|p| p.parse().map_err(ApiError::Validation))
        .unwrap_or(Ok(ProviderKind::Stripe))
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /api/v1/billing/plans
pub async fn list_plans(State(state): State<AppState>) -> Json<PlansResponse> {
    let providers = state
        .billing
        .as_ref()
        .map(|billing| billing.providers.configured())
        .unwrap_or_default();

    Json(PlansResponse {
        plans: PlanCatalog::all(),
        free_allowances: PlanCatalog::free_allowances()
            .iter()
            .map(|(capability, limit)| FreeAllowance {
                capability: *capability,
                daily_limit: *limit,
            })
            .collect(),
        trial_days: TRIAL_DAYS,
        providers,
    })
}

/// POST /api/v1/billing/trial
pub async fn start_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionView>> {
    let billing = state.billing()?;
    let sub = billing.subscriptions.start_trial(auth_user.user_id).await?;
    Ok(Json(SubscriptionView::new(&sub)))
}

/// POST /api/v1/billing/checkout/session
///
/// Works signed out too; the purchase then yields an anonymous token.
pub async fn create_checkout_session(
    State(state): State<AppState>,
    MaybeAuthUser(auth_user): MaybeAuthUser,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let billing = state.billing()?;
    let plan: PlanTier = req.plan.parse().map_err(ApiError::Validation)?;
    let provider = parse_provider(req.provider.as_deref())?;

    let grant = billing
        .checkout
        .start(auth_user.map(|u| u.user_id), plan, provider)
        .await?;

    Ok(Json(CheckoutResponse {
        provider: grant.provider,
        checkout_id: grant.provider_object_id,
        url: grant.redirect_url,
    }))
}

/// POST /api/v1/billing/payment-success
///
/// Client-reported return from checkout. The checkout is re-read from the
/// provider; nothing in the request body is trusted beyond its id.
pub async fn payment_success(
    State(state): State<AppState>,
    MaybeAuthUser(auth_user): MaybeAuthUser,
    Json(req): Json<PaymentSuccessRequest>,
) -> ApiResult<Json<CheckoutCompletion>> {
    let billing = state.billing()?;
    let provider = parse_provider(req.provider.as_deref())?;

    let completion = billing
        .checkout
        .complete(auth_user.map(|u| u.user_id), provider, &req.checkout_id)
        .await?;
    Ok(Json(completion))
}

/// POST /api/v1/billing/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionView>> {
    let billing = state.billing()?;
    let change = billing
        .subscriptions
        .cancel(auth_user.user_id, Origin::User)
        .await?;
    Ok(Json(SubscriptionView::new(change.subscription())))
}

/// GET /api/v1/billing/verify?token=
///
/// A bad token is an answer (`valid: false`), not an error.
pub async fn verify_token(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<TokenVerification>> {
    let billing = state.billing()?;
    let token = query.token.unwrap_or_default();
    Ok(Json(billing.entitlements.verify_token(&token)))
}

/// GET /api/v1/billing/status
pub async fn status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<EntitlementSummary>> {
    let billing = state.billing()?;
    Ok(Json(billing.entitlements.status(auth_user.user_id).await?))
}

/// GET /api/v1/billing/can-use/{capability}
pub async fn can_use(
    State(state): State<AppState>,
    RequestPrincipal(principal): RequestPrincipal,
    Path(capability): Path<String>,
) -> ApiResult<Json<Decision>> {
    let billing = state.billing()?;
    Ok(Json(billing.entitlements.can_use(&principal, &capability).await?))
}

/// POST /api/v1/billing/usage/{capability}
///
/// Consumes one use; a denial comes back as `402 upgrade_required`.
pub async fn record_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(capability): Path<String>,
) -> ApiResult<Json<Decision>> {
    let billing = state.billing()?;
    let decision = billing
        .entitlements
        .record_usage(auth_user.user_id, &capability)
        .await?;

    if !decision.allowed {
        return Err(denial(decision));
    }
    Ok(Json(decision))
}

/// PUT /api/v1/billing/auto-renew
pub async fn set_auto_renew(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<AutoRenewRequest>,
) -> ApiResult<Json<SubscriptionView>> {
    let billing = state.billing()?;
    let sub = billing
        .subscriptions
        .set_auto_renew(auth_user.user_id, req.enabled)
        .await?;
    Ok(Json(SubscriptionView::new(&sub)))
}
