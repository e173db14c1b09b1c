//! Provider webhook endpoints
//!
//! Providers only see the status code: 2xx means "stop retrying". Anything
//! that left the event unapplied for a transient reason must be non-2xx.

use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use fixitflow_billing::{SignatureHeaders, WebhookOutcome};
use fixitflow_shared::ProviderKind;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

fn signature_headers(headers: &HeaderMap) -> SignatureHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect()
}

async fn receive(
    state: &AppState,
    provider: ProviderKind,
    headers: &HeaderMap,
    body: &str,
) -> ApiResult<Json<WebhookOutcome>> {
    let billing = state.billing()?;

    billing
        .webhooks
        .handle(provider, body, &signature_headers(headers))
        .await
        .map(Json)
        .map_err(|e| {
            if e.is_transient() {
                tracing::error!(provider = %provider, error = %e, "Webhook failed; provider will retry");
            }
            ApiError::from(e)
        })
}

/// POST /webhook/stripe
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookOutcome>> {
    receive(&state, ProviderKind::Stripe, &headers, &body).await
}

/// POST /webhook/paypal
pub async fn paypal_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookOutcome>> {
    receive(&state, ProviderKind::PayPal, &headers, &body).await
}
