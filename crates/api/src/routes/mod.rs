//! API routes

pub mod admin;
pub mod billing;
pub mod gate;
#[cfg(test)]
mod router_tests;
pub mod webhooks;

use axum::{
    extract::State,
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{optional_auth, require_admin, require_auth},
    state::AppState,
};

pub use gate::{gated, require_capability};

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "billing": state.billing.is_some(),
    }))
}

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let public = Router::new()
        .route("/plans", get(billing::list_plans))
        .route("/verify", get(billing::verify_token));

    let signed_in_optional = Router::new()
        .route("/checkout/session", post(billing::create_checkout_session))
        .route("/payment-success", post(billing::payment_success))
        .route("/can-use/{capability}", get(billing::can_use))
        .route_layer(middleware::from_fn_with_state(auth_state.clone(), optional_auth));

    let signed_in = Router::new()
        .route("/trial", post(billing::start_trial))
        .route("/cancel", post(billing::cancel))
        .route("/status", get(billing::status))
        .route("/usage/{capability}", post(billing::record_usage))
        .route("/auto-renew", put(billing::set_auto_renew))
        .route_layer(middleware::from_fn_with_state(auth_state.clone(), require_auth));

    let admin = Router::new()
        .route("/webhooks", get(admin::list_webhooks))
        .route("/webhooks/replay-failed", post(admin::replay_failed))
        .route("/webhooks/{provider}/{event_id}/replay", post(admin::replay_webhook))
        .route("/invariants", get(admin::run_invariants))
        .route("/invariants/{name}", get(admin::run_invariant))
        .route("/sweep", post(admin::run_sweep))
        .route("/users/{user_id}/subscription", get(admin::get_user_subscription))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(auth_state, require_auth));

    let webhooks = Router::new()
        .route("/stripe", post(webhooks::stripe_webhook))
        .route("/paypal", post(webhooks::paypal_webhook));

    Router::new()
        .route("/health", get(health))
        .nest(
            "/api/v1/billing",
            public.merge(signed_in_optional).merge(signed_in),
        )
        .nest("/api/v1/admin", admin)
        .nest("/webhook", webhooks)
        .with_state(state)
}
