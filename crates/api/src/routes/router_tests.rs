//! Router-level tests
//!
//! Drive the full axum router with `oneshot` over in-memory billing stores
//! and a test payment provider:
//! - Plans and token verification (public)
//! - Trial, cancel, status, usage (authenticated)
//! - Checkout completion and anonymous tokens
//! - Webhook acknowledgement and signature rejection
//! - Admin protection and the capability gate

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use fixitflow_billing::{
    notify::RecordingNotifier,
    providers::{CheckoutPrincipal, CheckoutState, GrantOutcome, ProviderEventKind, Purchase},
    AnonymousToken, BillingError, BillingResult, BillingService, CheckoutGrant, MemoryBillingStore,
    MemoryUsageStore, PaymentProvider, ProviderEvent, ProviderRegistry, SignatureHeaders,
};
use fixitflow_shared::{PlanTier, ProviderKind, UserId};
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use tokio::sync::{Barrier, Mutex};
use tower::ServiceExt;

use crate::{
    auth::{optional_auth, ENTITLEMENT_TOKEN_HEADER},
    config::Config,
    routes::{create_router, gated},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "x-test-signature";

#[derive(Default)]
struct TestProvider {
    checkouts: Mutex<std::collections::HashMap<String, CheckoutState>>,
}

#[async_trait]
impl PaymentProvider for TestProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    async fn create_grant(&self, principal: &CheckoutPrincipal, plan: PlanTier) -> BillingResult<CheckoutGrant> {
        let id = match principal.user_id() {
            Some(user) => format!("cs_{}_{}", plan, user),
            None => format!("cs_{}_anon", plan),
        };
        Ok(CheckoutGrant {
            provider: ProviderKind::Stripe,
            redirect_url: format!("https://checkout.test/{}", id),
            provider_object_id: id,
        })
    }

    async fn confirm(&self, payload: &str, headers: &SignatureHeaders) -> BillingResult<ProviderEvent> {
        if headers.get(SIGNATURE_HEADER) != Some("ok") {
            return Err(BillingError::InvalidSignature);
        }
        Ok(serde_json::from_str(payload)?)
    }

    async fn fetch_checkout(&self, checkout_id: &str) -> BillingResult<CheckoutState> {
        self.checkouts
            .lock()
            .await
            .get(checkout_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(checkout_id.to_string()))
    }

    async fn revoke(&self, _provider_object_id: &str) -> BillingResult<()> {
        Ok(())
    }
}

fn test_config(enable_billing: bool) -> Config {
    Config {
        database_url: "postgres://localhost/fixitflow_test".to_string(),
        database_max_connections: 1,
        bind_address: "127.0.0.1:0".to_string(),
        jwt_secret: "router-test-jwt-secret".to_string(),
        token_signing_secret: "router-test-token-secret".to_string(),
        redis_url: None,
        enable_billing,
        allowed_origins: vec![],
        public_base_url: "http://localhost:3000".to_string(),
    }
}

struct Harness {
    app: Router,
    state: AppState,
    store: Arc<MemoryBillingStore>,
    provider: Arc<TestProvider>,
}

impl Harness {
    fn new() -> Self {
        let config = test_config(true);
        let store = Arc::new(MemoryBillingStore::new());
        let provider = Arc::new(TestProvider::default());
        let billing = BillingService::new(
            store.clone(),
            Arc::new(RecordingNotifier::new()),
            Arc::new(MemoryUsageStore::new()),
            ProviderRegistry::new().register(provider.clone()),
            config.token_signing_secret.as_bytes().to_vec(),
        );
        let state = AppState::with_billing(config, Some(billing));

        Self {
            app: create_router(state.clone()),
            state,
            store,
            provider,
        }
    }

    fn billing(&self) -> &BillingService {
        self.state.billing.as_ref().unwrap()
    }

    /// New free user and a session token for them
    async fn user(&self) -> (UserId, String) {
        self.user_with_role("user").await
    }

    async fn user_with_role(&self, role: &str) -> (UserId, String) {
        let user = UserId::new();
        self.store
            .create_user(user, Some("member@example.com"), OffsetDateTime::now_utc())
            .await;
        let token = self.state.jwt_manager.generate_token(user.0, None, role).unwrap();
        (user, token)
    }
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn activation_event(event_id: &str, user: UserId, object_id: &str) -> String {
    let now = OffsetDateTime::now_utc();
    let event = ProviderEvent {
        provider: ProviderKind::Stripe,
        event_id: event_id.to_string(),
        event_type: "customer.subscription.created".to_string(),
        occurred_at: now,
        kind: ProviderEventKind::SubscriptionActivated(GrantOutcome {
            user_id: Some(user),
            plan: PlanTier::Monthly,
            provider_object_id: object_id.to_string(),
            customer_id: Some("cus_test".to_string()),
            period_start: Some(now),
            period_end: Some(now + Duration::days(30)),
        }),
    };
    serde_json::to_string(&event).unwrap()
}

fn webhook(payload: &str, signature: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/webhook/stripe")
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

// =============================================================================
// Public routes
// =============================================================================

#[tokio::test]
async fn test_plans_are_public() {
    let h = Harness::new();
    let (status, body) = send(&h.app, request(Method::GET, "/api/v1/billing/plans", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plans"].as_array().unwrap().len(), 4);
    assert_eq!(body["trial_days"], 7);
    assert_eq!(body["providers"], json!(["stripe"]));
}

#[tokio::test]
async fn test_verify_token() {
    let h = Harness::new();
    let token = AnonymousToken::for_purchase(PlanTier::Daily, "cs_1", OffsetDateTime::now_utc()).unwrap();
    let encoded = h.billing().entitlements.issue_token(&token).unwrap();

    let uri = format!("/api/v1/billing/verify?token={}", encoded);
    let (status, body) = send(&h.app, request(Method::GET, &uri, None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["plan"], "daily");

    let (status, body) = send(
        &h.app,
        request(Method::GET, "/api/v1/billing/verify?token=bm90LWEtdG9rZW4", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], false);
}

// =============================================================================
// Trial
// =============================================================================

#[tokio::test]
async fn test_trial_requires_auth() {
    let h = Harness::new();
    let (status, body) = send(&h.app, request(Method::POST, "/api/v1/billing/trial", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn test_concurrent_trial_requests() {
    let h = Harness::new();
    let (_, token) = h.user().await;

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = vec![];
    for _ in 0..2 {
        let app = h.app.clone();
        let barrier = barrier.clone();
        let req = request(Method::POST, "/api/v1/billing/trial", Some(&token), None);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            app.oneshot(req).await.unwrap().status()
        }));
    }

    let mut statuses = vec![];
    for handle in handles {
        statuses.push(handle.await.unwrap());
    }
    statuses.sort();
    assert_eq!(statuses, vec![StatusCode::OK, StatusCode::BAD_REQUEST]);
}

#[tokio::test]
async fn test_trial_unlocks_capability() {
    let h = Harness::new();
    let (_, token) = h.user().await;

    let (_, before) = send(&h.app, request(Method::GET, "/api/v1/billing/can-use/aiChat", Some(&token), None)).await;
    assert_eq!(before["allowed"], false);

    let (status, body) = send(&h.app, request(Method::POST, "/api/v1/billing/trial", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"], "monthly");
    assert_eq!(body["status"], "trial");

    let (_, after) = send(&h.app, request(Method::GET, "/api/v1/billing/can-use/aiChat", Some(&token), None)).await;
    assert_eq!(after["allowed"], true);

    let (_, unknown) = send(
        &h.app,
        request(Method::GET, "/api/v1/billing/can-use/teleportation", Some(&token), None),
    )
    .await;
    assert_eq!(unknown["allowed"], false);
}

// =============================================================================
// Cancel, status, usage
// =============================================================================

#[tokio::test]
async fn test_cancel() {
    let h = Harness::new();
    let (_, token) = h.user().await;

    let (status, body) = send(&h.app, request(Method::POST, "/api/v1/billing/cancel", Some(&token), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_state");

    send(&h.app, request(Method::POST, "/api/v1/billing/trial", Some(&token), None)).await;
    let (status, body) = send(&h.app, request(Method::POST, "/api/v1/billing/cancel", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["plan"], "free");
    assert_eq!(body["has_premium_access"], false);
}

#[tokio::test]
async fn test_usage_quota_then_upgrade_required() {
    let h = Harness::new();
    let (_, token) = h.user().await;

    for remaining in [2, 1, 0] {
        let (status, body) = send(
            &h.app,
            request(Method::POST, "/api/v1/billing/usage/imageUpload", Some(&token), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remaining_today"], remaining);
    }

    let (status, body) = send(
        &h.app,
        request(Method::POST, "/api/v1/billing/usage/imageUpload", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "upgrade_required");
    assert_eq!(body["capability"], "imageUpload");
    assert_eq!(body["plans"], json!(["daily", "monthly", "annual"]));

    let (_, summary) = send(&h.app, request(Method::GET, "/api/v1/billing/status", Some(&token), None)).await;
    assert_eq!(summary["plan"], "free");
    assert_eq!(summary["trial_available"], true);
}

#[tokio::test]
async fn test_auto_renew_toggle() {
    let h = Harness::new();
    let (user, token) = h.user().await;
    h.billing()
        .webhooks
        .handle(
            ProviderKind::Stripe,
            &activation_event("evt_ar", user, "sub_ar"),
            &SignatureHeaders::new().with(SIGNATURE_HEADER, "ok"),
        )
        .await
        .unwrap();

    let (status, body) = send(
        &h.app,
        request(Method::PUT, "/api/v1/billing/auto-renew", Some(&token), Some(json!({ "enabled": false }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["auto_renew"], false);
    assert_eq!(body["provider"], "stripe");
}

// =============================================================================
// Checkout
// =============================================================================

#[tokio::test]
async fn test_checkout_session_validation() {
    let h = Harness::new();
    let (_, token) = h.user().await;

    let (status, _) = send(
        &h.app,
        request(Method::POST, "/api/v1/billing/checkout/session", Some(&token), Some(json!({ "plan": "platinum" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &h.app,
        request(Method::POST, "/api/v1/billing/checkout/session", Some(&token), Some(json!({ "plan": "monthly" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["url"].as_str().unwrap().starts_with("https://checkout.test/"));

    // Signed out buyers get a checkout too
    let (status, body) = send(
        &h.app,
        request(Method::POST, "/api/v1/billing/checkout/session", None, Some(json!({ "plan": "daily" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checkout_id"], "cs_daily_anon");
}

#[tokio::test]
async fn test_anonymous_purchase_and_token_use() {
    let h = Harness::new();
    h.provider.checkouts.lock().await.insert(
        "cs_anon".to_string(),
        CheckoutState::Completed {
            checkout_id: "cs_anon".to_string(),
            purchase: Purchase::Anonymous {
                plan: PlanTier::Daily,
                amount_cents: Some(299),
                purchased_at: OffsetDateTime::now_utc(),
            },
        },
    );

    let (status, body) = send(
        &h.app,
        request(Method::POST, "/api/v1/billing/payment-success", None, Some(json!({ "session_id": "cs_anon" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "anonymous_token");
    let token = body["token"].as_str().unwrap().to_string();

    let req = Request::builder()
        .uri("/api/v1/billing/can-use/videoChat")
        .header(ENTITLEMENT_TOKEN_HEADER, &token)
        .body(Body::empty())
        .unwrap();
    let (_, decision) = send(&h.app, req).await;
    assert_eq!(decision["allowed"], true);
    assert_eq!(decision["reason"], "anonymous_token");

    // Daily pass does not include priority support
    let req = Request::builder()
        .uri("/api/v1/billing/can-use/prioritySupport")
        .header(ENTITLEMENT_TOKEN_HEADER, &token)
        .body(Body::empty())
        .unwrap();
    let (_, decision) = send(&h.app, req).await;
    assert_eq!(decision["allowed"], false);
}

#[tokio::test]
async fn test_payment_success_pending() {
    let h = Harness::new();
    let (_, token) = h.user().await;
    h.provider
        .checkouts
        .lock()
        .await
        .insert("cs_pending".to_string(), CheckoutState::Pending);

    let (status, body) = send(
        &h.app,
        request(
            Method::POST,
            "/api/v1/billing/payment-success",
            Some(&token),
            Some(json!({ "checkout_id": "cs_pending", "provider": "stripe" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
}

// =============================================================================
// Webhooks
// =============================================================================

#[tokio::test]
async fn test_webhook_applied_then_duplicate() {
    let h = Harness::new();
    let (user, token) = h.user().await;
    let payload = activation_event("evt_1", user, "sub_1");

    let (status, body) = send(&h.app, webhook(&payload, "ok")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"], "applied");

    let (status, body) = send(&h.app, webhook(&payload, "ok")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"], "duplicate");

    let (_, summary) = send(&h.app, request(Method::GET, "/api/v1/billing/status", Some(&token), None)).await;
    assert_eq!(summary["plan"], "monthly");
    assert_eq!(summary["status"], "active");
}

#[tokio::test]
async fn test_webhook_bad_signature_rejected() {
    let h = Harness::new();
    let (user, token) = h.user().await;

    let (status, body) = send(&h.app, webhook(&activation_event("evt_1", user, "sub_1"), "forged")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_signature");

    let (_, summary) = send(&h.app, request(Method::GET, "/api/v1/billing/status", Some(&token), None)).await;
    assert_eq!(summary["plan"], "free");
}

#[tokio::test]
async fn test_unconfigured_provider_webhook() {
    let h = Harness::new();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/webhook/paypal")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Admin, disabled billing, capability gate
// =============================================================================

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let h = Harness::new();
    let (_, user_token) = h.user().await;
    let (_, admin_token) = h.user_with_role("admin").await;

    let (status, _) = send(&h.app, request(Method::GET, "/api/v1/admin/webhooks", Some(&user_token), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&h.app, request(Method::GET, "/api/v1/admin/webhooks", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&h.app, request(Method::GET, "/api/v1/admin/webhooks", Some(&admin_token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());

    let (status, body) = send(&h.app, request(Method::POST, "/api/v1/admin/sweep", Some(&admin_token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expired"], 0);
}

#[tokio::test]
async fn test_billing_disabled() {
    let app = create_router(AppState::with_billing(test_config(false), None));

    let (status, body) = send(&app, request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["billing"], false);

    let (status, body) = send(&app, request(Method::GET, "/api/v1/billing/plans", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["providers"], json!([]));

    let token = AppState::with_billing(test_config(false), None)
        .jwt_manager
        .generate_token(uuid::Uuid::new_v4(), None, "user")
        .unwrap();
    let (status, body) = send(&app, request(Method::POST, "/api/v1/billing/trial", Some(&token), None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "billing_disabled");
}

#[tokio::test]
async fn test_capability_gate() {
    let h = Harness::new();
    let content = gated(
        Router::new().route("/content/ai-chat", get(|| async { "answer" })),
        &h.state,
        "aiChat",
    )
    .route_layer(middleware::from_fn_with_state(h.state.auth_state(), optional_auth))
    .with_state(h.state.clone());

    let (status, body) = send(&content, request(Method::GET, "/content/ai-chat", None, None)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"], "upgrade_required");

    let (_, token) = h.user().await;
    let (status, _) = send(&content, request(Method::GET, "/content/ai-chat", Some(&token), None)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    send(&h.app, request(Method::POST, "/api/v1/billing/trial", Some(&token), None)).await;
    let response = content
        .clone()
        .oneshot(request(Method::GET, "/content/ai-chat", Some(&token), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
