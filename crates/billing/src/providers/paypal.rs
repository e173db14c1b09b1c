//! PayPal adapter over the REST API
//!
//! Registered users subscribe through Billing Subscriptions (`I-...` ids);
//! anonymous buyers pay for a one-off Order tagged `anon:<plan>`. Webhooks
//! are authenticated by asking PayPal to verify the transmission signature.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use fixitflow_shared::{PlanTier, ProviderKind, UserId};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use super::{
    with_timeout, CheckoutGrant, CheckoutPrincipal, CheckoutState, GrantOutcome, PaymentProvider,
    ProviderEvent, ProviderEventKind, Purchase, SignatureHeaders,
};
use crate::client::PayPalConfig;
use crate::error::{BillingError, BillingResult};

const AUTH_ALGO_HEADER: &str = "paypal-auth-algo";
const CERT_URL_HEADER: &str = "paypal-cert-url";
const TRANSMISSION_ID_HEADER: &str = "paypal-transmission-id";
const TRANSMISSION_SIG_HEADER: &str = "paypal-transmission-sig";
const TRANSMISSION_TIME_HEADER: &str = "paypal-transmission-time";

/// Refresh the OAuth token this long before PayPal says it expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

const ANONYMOUS_ORDER_PREFIX: &str = "anon:";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    id: String,
    #[serde(default)]
    links: Vec<Link>,
}

impl CreatedResource {
    fn approval_url(&self) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    event_type: String,
    create_time: Option<String>,
    #[serde(default)]
    resource: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BillingInfo {
    next_billing_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayPalSubscription {
    id: String,
    status: String,
    plan_id: Option<String>,
    custom_id: Option<String>,
    start_time: Option<String>,
    billing_info: Option<BillingInfo>,
}

/// `total` on v1 sales, `value` on v2 captures and orders
#[derive(Debug, Deserialize)]
struct Money {
    total: Option<String>,
    value: Option<String>,
}

impl Money {
    fn cents(&self) -> Option<i64> {
        self.total
            .as_deref()
            .or(self.value.as_deref())
            .and_then(parse_cents)
    }
}

#[derive(Debug, Deserialize)]
struct Sale {
    billing_agreement_id: Option<String>,
    amount: Option<Money>,
}

#[derive(Debug, Deserialize)]
struct RelatedIds {
    order_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SupplementaryData {
    related_ids: Option<RelatedIds>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    custom_id: Option<String>,
    amount: Option<Money>,
    create_time: Option<String>,
    supplementary_data: Option<SupplementaryData>,
}

#[derive(Debug, Deserialize)]
struct PurchaseUnit {
    custom_id: Option<String>,
    amount: Option<Money>,
}

#[derive(Debug, Deserialize)]
struct Order {
    status: String,
    create_time: Option<String>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    verification_status: String,
}

fn parse_time(value: Option<&str>) -> Option<OffsetDateTime> {
    value.and_then(|v| OffsetDateTime::parse(v, &Rfc3339).ok())
}

/// "9.99" -> 999
fn parse_cents(amount: &str) -> Option<i64> {
    let (whole, frac) = amount.split_once('.').unwrap_or((amount, "0"));
    let whole: i64 = whole.parse().ok()?;
    let frac = format!("{:0<2}", frac);
    let frac: i64 = frac.get(..2)?.parse().ok()?;
    Some(whole * 100 + frac)
}

fn anonymous_plan(custom_id: Option<&str>) -> Option<PlanTier> {
    custom_id
        .and_then(|c| c.strip_prefix(ANONYMOUS_ORDER_PREFIX))
        .and_then(|p| p.parse::<PlanTier>().ok())
        .filter(PlanTier::is_paid)
}

pub struct PayPalProvider {
    config: PayPalConfig,
    http: reqwest::Client,
    token: RwLock<Option<CachedToken>>,
}

impl PayPalProvider {
    pub fn new(config: PayPalConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            token: RwLock::new(None),
        }
    }

    async fn access_token(&self) -> BillingResult<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let response = RetryIf::spawn(
            strategy,
            || self.request_token(),
            |e: &BillingError| e.is_transient(),
        )
        .await?;

        let value = response.access_token.clone();
        *self.token.write().await = Some(CachedToken {
            value: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        });
        Ok(value)
    }

    async fn request_token(&self) -> BillingResult<TokenResponse> {
        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.config.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BillingResult<reqwest::Response> {
        let token = self.access_token().await?;
        let mut request = self
            .http
            .request(method, format!("{}{}", self.config.api_base, path))
            .bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        check_status(request.send().await?).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BillingResult<T> {
        Ok(self.send(method, path, body).await?.json().await?)
    }

    async fn get_subscription(&self, id: &str) -> BillingResult<PayPalSubscription> {
        self.send_json(Method::GET, &format!("/v1/billing/subscriptions/{}", id), None)
            .await
    }

    fn outcome_from_subscription(&self, sub: &PayPalSubscription) -> BillingResult<GrantOutcome> {
        let plan = sub
            .plan_id
            .as_deref()
            .and_then(|id| self.config.plan_ids.tier_for(id))
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "PayPal subscription {} has an unknown plan {:?}",
                    sub.id, sub.plan_id
                ))
            })?;

        Ok(GrantOutcome {
            user_id: sub.custom_id.as_deref().and_then(|c| c.parse::<UserId>().ok()),
            plan,
            provider_object_id: sub.id.clone(),
            customer_id: None,
            period_start: parse_time(sub.start_time.as_deref()),
            period_end: parse_time(
                sub.billing_info
                    .as_ref()
                    .and_then(|b| b.next_billing_time.as_deref()),
            ),
        })
    }

    async fn verify_webhook(
        &self,
        event: &serde_json::Value,
        headers: &SignatureHeaders,
    ) -> BillingResult<()> {
        let body = json!({
            "auth_algo": headers.require(AUTH_ALGO_HEADER)?,
            "cert_url": headers.require(CERT_URL_HEADER)?,
            "transmission_id": headers.require(TRANSMISSION_ID_HEADER)?,
            "transmission_sig": headers.require(TRANSMISSION_SIG_HEADER)?,
            "transmission_time": headers.require(TRANSMISSION_TIME_HEADER)?,
            "webhook_id": self.config.webhook_id,
            "webhook_event": event,
        });

        let verdict: VerifyResponse = self
            .send_json(
                Method::POST,
                "/v1/notifications/verify-webhook-signature",
                Some(body),
            )
            .await?;

        if verdict.verification_status != "SUCCESS" {
            tracing::warn!(
                status = %verdict.verification_status,
                "PayPal webhook signature verification failed"
            );
            return Err(BillingError::InvalidSignature);
        }
        Ok(())
    }

    async fn translate(&self, envelope: WebhookEnvelope) -> BillingResult<ProviderEvent> {
        let occurred_at =
            parse_time(envelope.create_time.as_deref()).unwrap_or_else(OffsetDateTime::now_utc);

        let kind = match envelope.event_type.as_str() {
            "BILLING.SUBSCRIPTION.ACTIVATED" => {
                let sub: PayPalSubscription = serde_json::from_value(envelope.resource)?;
                ProviderEventKind::SubscriptionActivated(self.outcome_from_subscription(&sub)?)
            }
            "BILLING.SUBSCRIPTION.CANCELLED" | "BILLING.SUBSCRIPTION.EXPIRED" => {
                let sub: PayPalSubscription = serde_json::from_value(envelope.resource)?;
                ProviderEventKind::SubscriptionCancelled {
                    provider_object_id: sub.id,
                }
            }
            // PayPal suspends after failed collection and may reactivate the
            // same subscription; the term runs out on its own if it doesn't.
            "BILLING.SUBSCRIPTION.PAYMENT.FAILED" | "BILLING.SUBSCRIPTION.SUSPENDED" => {
                let sub: PayPalSubscription = serde_json::from_value(envelope.resource)?;
                ProviderEventKind::PaymentFailed {
                    provider_object_id: Some(sub.id),
                    customer_id: None,
                    amount_cents: None,
                }
            }
            "PAYMENT.SALE.COMPLETED" => {
                let sale: Sale = serde_json::from_value(envelope.resource)?;
                match sale.billing_agreement_id {
                    Some(subscription_id) => {
                        // The sale does not carry the new term; the subscription does
                        let sub = self.get_subscription(&subscription_id).await?;
                        let period_end = parse_time(
                            sub.billing_info
                                .as_ref()
                                .and_then(|b| b.next_billing_time.as_deref()),
                        )
                        .ok_or_else(|| {
                            BillingError::PayPalApi(format!(
                                "Subscription {} has no next billing time",
                                subscription_id
                            ))
                        })?;
                        ProviderEventKind::SubscriptionRenewed {
                            provider_object_id: subscription_id,
                            period_end,
                            amount_cents: sale.amount.as_ref().and_then(Money::cents),
                        }
                    }
                    None => ProviderEventKind::Unhandled {
                        event_type: envelope.event_type.clone(),
                    },
                }
            }
            "PAYMENT.CAPTURE.COMPLETED" => {
                let capture: Capture = serde_json::from_value(envelope.resource)?;
                match anonymous_plan(capture.custom_id.as_deref()) {
                    Some(plan) => ProviderEventKind::CheckoutCompleted {
                        checkout_id: capture
                            .supplementary_data
                            .and_then(|s| s.related_ids)
                            .and_then(|r| r.order_id)
                            .unwrap_or(capture.id),
                        purchase: Purchase::Anonymous {
                            plan,
                            amount_cents: capture.amount.as_ref().and_then(Money::cents),
                            purchased_at: parse_time(capture.create_time.as_deref())
                                .unwrap_or(occurred_at),
                        },
                    },
                    None => ProviderEventKind::Unhandled {
                        event_type: envelope.event_type.clone(),
                    },
                }
            }
            _ => ProviderEventKind::Unhandled {
                event_type: envelope.event_type.clone(),
            },
        };

        Ok(ProviderEvent {
            provider: ProviderKind::PayPal,
            event_id: envelope.id,
            event_type: envelope.event_type,
            occurred_at,
            kind,
        })
    }

    async fn fetch_subscription_checkout(&self, id: &str) -> BillingResult<CheckoutState> {
        let sub = self.get_subscription(id).await?;
        match sub.status.as_str() {
            "ACTIVE" => Ok(CheckoutState::Completed {
                checkout_id: id.to_string(),
                purchase: Purchase::Subscription(self.outcome_from_subscription(&sub)?),
            }),
            "APPROVAL_PENDING" | "APPROVED" => Ok(CheckoutState::Pending),
            other => Ok(CheckoutState::Failed(format!("subscription is {}", other))),
        }
    }

    async fn fetch_order_checkout(&self, id: &str) -> BillingResult<CheckoutState> {
        let path = format!("/v2/checkout/orders/{}", id);
        let order: Order = self.send_json(Method::GET, &path, None).await?;

        let unit = order.purchase_units.first();
        let Some(plan) = anonymous_plan(unit.and_then(|u| u.custom_id.as_deref())) else {
            return Ok(CheckoutState::Failed("order is not a FixItFlow purchase".to_string()));
        };
        let amount_cents = unit.and_then(|u| u.amount.as_ref()).and_then(Money::cents);

        let status = match order.status.as_str() {
            "APPROVED" => {
                let captured: Order = self
                    .send_json(Method::POST, &format!("{}/capture", path), Some(json!({})))
                    .await?;
                tracing::info!(order_id = %id, status = %captured.status, "Captured PayPal order");
                captured.status
            }
            _ => order.status,
        };

        match status.as_str() {
            "COMPLETED" => Ok(CheckoutState::Completed {
                checkout_id: id.to_string(),
                purchase: Purchase::Anonymous {
                    plan,
                    amount_cents,
                    purchased_at: parse_time(order.create_time.as_deref())
                        .unwrap_or_else(OffsetDateTime::now_utc),
                },
            }),
            "CREATED" | "SAVED" | "PAYER_ACTION_REQUIRED" => Ok(CheckoutState::Pending),
            other => Ok(CheckoutState::Failed(format!("order is {}", other))),
        }
    }
}

/// Map PayPal HTTP failures: 429 and 5xx are worth retrying, 4xx are not
async fn check_status(response: reqwest::Response) -> BillingResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        tracing::warn!(status = %status, "PayPal temporarily unavailable");
        return Err(BillingError::ProviderUnavailable(format!(
            "paypal returned {}",
            status
        )));
    }
    Err(BillingError::PayPalApi(format!("{}: {}", status, body)))
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::PayPal
    }

    async fn create_grant(
        &self,
        principal: &CheckoutPrincipal,
        plan: PlanTier,
    ) -> BillingResult<CheckoutGrant> {
        let created: CreatedResource = with_timeout(ProviderKind::PayPal, self.config.timeout, async {
            match principal {
                CheckoutPrincipal::Registered { user_id, .. } => {
                    let plan_id = self.config.plan_ids.for_tier(plan).ok_or_else(|| {
                        BillingError::Validation(format!("Plan '{}' is not available for purchase", plan))
                    })?;
                    let body = json!({
                        "plan_id": plan_id,
                        "custom_id": user_id.to_string(),
                        "application_context": {
                            "brand_name": "FixItFlow",
                            "user_action": "SUBSCRIBE_NOW",
                            "return_url": self.config.return_url,
                            "cancel_url": self.config.cancel_url,
                        }
                    });
                    self.send_json(Method::POST, "/v1/billing/subscriptions", Some(body))
                        .await
                }
                CheckoutPrincipal::Anonymous => {
                    let definition = crate::plans::PlanCatalog::get(plan);
                    if !plan.is_paid() {
                        return Err(BillingError::Validation(format!(
                            "Plan '{}' is not available for purchase",
                            plan
                        )));
                    }
                    let body = json!({
                        "intent": "CAPTURE",
                        "purchase_units": [{
                            "custom_id": format!("{}{}", ANONYMOUS_ORDER_PREFIX, plan),
                            "description": definition.name,
                            "amount": {
                                "currency_code": "USD",
                                "value": format!("{}.{:02}", definition.price_cents / 100, definition.price_cents % 100),
                            }
                        }],
                        "application_context": {
                            "brand_name": "FixItFlow",
                            "return_url": self.config.return_url,
                            "cancel_url": self.config.cancel_url,
                        }
                    });
                    self.send_json(Method::POST, "/v2/checkout/orders", Some(body))
                        .await
                }
            }
        })
        .await?;

        let redirect_url = created
            .approval_url()
            .ok_or_else(|| BillingError::PayPalApi(format!("No approval link for {}", created.id)))?
            .to_string();

        tracing::info!(
            paypal_id = %created.id,
            plan = %plan,
            user_id = ?principal.user_id(),
            "Created PayPal checkout"
        );

        Ok(CheckoutGrant {
            provider: ProviderKind::PayPal,
            provider_object_id: created.id,
            redirect_url,
        })
    }

    async fn confirm(&self, payload: &str, headers: &SignatureHeaders) -> BillingResult<ProviderEvent> {
        // Header presence is checked before any network call
        headers.require(TRANSMISSION_SIG_HEADER)?;

        let raw: serde_json::Value = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(error = %e, "PayPal webhook body is not JSON");
            BillingError::InvalidSignature
        })?;

        with_timeout(ProviderKind::PayPal, self.config.timeout, async {
            self.verify_webhook(&raw, headers).await?;
            let envelope: WebhookEnvelope = serde_json::from_value(raw).map_err(|e| {
                BillingError::UnknownEvent(format!("unparseable PayPal event: {}", e))
            })?;
            self.translate(envelope).await
        })
        .await
    }

    async fn fetch_checkout(&self, checkout_id: &str) -> BillingResult<CheckoutState> {
        with_timeout(ProviderKind::PayPal, self.config.timeout, async {
            if checkout_id.starts_with("I-") {
                self.fetch_subscription_checkout(checkout_id).await
            } else {
                self.fetch_order_checkout(checkout_id).await
            }
        })
        .await
    }

    async fn revoke(&self, provider_object_id: &str) -> BillingResult<()> {
        with_timeout(ProviderKind::PayPal, self.config.timeout, async {
            self.send(
                Method::POST,
                &format!("/v1/billing/subscriptions/{}/cancel", provider_object_id),
                Some(json!({ "reason": "Cancelled by customer" })),
            )
            .await
        })
        .await?;

        tracing::info!(subscription_id = %provider_object_id, "Cancelled PayPal subscription");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PriceIds;
    use mockito::Matcher;

    fn config(api_base: String) -> PayPalConfig {
        PayPalConfig {
            client_id: "client".into(),
            client_secret: "secret".into(),
            webhook_id: "WH-CONFIG".into(),
            api_base,
            plan_ids: PriceIds {
                daily: String::new(),
                monthly: "P-MONTHLY".into(),
                annual: "P-ANNUAL".into(),
            },
            return_url: "http://localhost/return".into(),
            cancel_url: "http://localhost/cancel".into(),
            timeout: Duration::from_secs(5),
        }
    }

    async fn mock_token(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/v1/oauth2/token")
            .with_status(200)
            .with_body(r#"{"access_token":"A21","token_type":"Bearer","expires_in":32400}"#)
            .create_async()
            .await
    }

    fn signed_headers() -> SignatureHeaders {
        SignatureHeaders::new()
            .with("PAYPAL-AUTH-ALGO", "SHA256withRSA")
            .with("PAYPAL-CERT-URL", "https://api.paypal.com/cert.pem")
            .with("PAYPAL-TRANSMISSION-ID", "t-1")
            .with("PAYPAL-TRANSMISSION-SIG", "sig")
            .with("PAYPAL-TRANSMISSION-TIME", "2027-01-15T08:00:00Z")
    }

    #[test]
    fn test_parse_cents() {
        assert_eq!(parse_cents("9.99"), Some(999));
        assert_eq!(parse_cents("99.9"), Some(9990));
        assert_eq!(parse_cents("2"), Some(200));
        assert_eq!(parse_cents("abc"), None);
    }

    #[test]
    fn test_anonymous_plan_tag() {
        assert_eq!(anonymous_plan(Some("anon:daily")), Some(PlanTier::Daily));
        assert_eq!(anonymous_plan(Some("anon:free")), None);
        assert_eq!(anonymous_plan(Some("some-user-id")), None);
        assert_eq!(anonymous_plan(None), None);
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/v1/oauth2/token")
            .match_header("authorization", Matcher::Regex("^Basic ".into()))
            .with_status(200)
            .with_body(r#"{"access_token":"A21","expires_in":32400}"#)
            .expect(1)
            .create_async()
            .await;

        let provider = PayPalProvider::new(config(server.url()));
        assert_eq!(provider.access_token().await.unwrap(), "A21");
        assert_eq!(provider.access_token().await.unwrap(), "A21");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_subscription_returns_approval_link() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let user = UserId::new();
        let create = server
            .mock("POST", "/v1/billing/subscriptions")
            .match_header("authorization", "Bearer A21")
            .match_body(Matcher::PartialJson(json!({
                "plan_id": "P-MONTHLY",
                "custom_id": user.to_string(),
            })))
            .with_status(201)
            .with_body(
                r#"{"id":"I-SUB1","status":"APPROVAL_PENDING","links":[
                    {"href":"https://paypal.test/approve/I-SUB1","rel":"approve","method":"GET"}]}"#,
            )
            .create_async()
            .await;

        let provider = PayPalProvider::new(config(server.url()));
        let principal = CheckoutPrincipal::Registered {
            user_id: user,
            email: None,
            stripe_customer_id: None,
        };
        let grant = provider.create_grant(&principal, PlanTier::Monthly).await.unwrap();
        assert_eq!(grant.provider_object_id, "I-SUB1");
        assert_eq!(grant.redirect_url, "https://paypal.test/approve/I-SUB1");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_unconfigured_plan_is_rejected_without_calling_paypal() {
        let server = mockito::Server::new_async().await;
        let provider = PayPalProvider::new(config(server.url()));
        let principal = CheckoutPrincipal::Registered {
            user_id: UserId::new(),
            email: None,
            stripe_customer_id: None,
        };
        let result = provider.create_grant(&principal, PlanTier::Daily).await;
        assert!(matches!(result, Err(BillingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_confirm_rejects_missing_headers() {
        let server = mockito::Server::new_async().await;
        let provider = PayPalProvider::new(config(server.url()));
        let result = provider
            .confirm(r#"{"id":"WH-1"}"#, &SignatureHeaders::new())
            .await;
        assert!(matches!(result, Err(BillingError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_confirm_rejects_failed_verification() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _verify = server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .with_status(200)
            .with_body(r#"{"verification_status":"FAILURE"}"#)
            .create_async()
            .await;

        let provider = PayPalProvider::new(config(server.url()));
        let payload = r#"{"id":"WH-1","event_type":"BILLING.SUBSCRIPTION.CANCELLED","resource":{"id":"I-SUB1","status":"CANCELLED"}}"#;
        let result = provider.confirm(payload, &signed_headers()).await;
        assert!(matches!(result, Err(BillingError::InvalidSignature)));
    }

    #[tokio::test]
    async fn test_confirm_translates_activation() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let verify = server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .match_body(Matcher::PartialJson(json!({
                "webhook_id": "WH-CONFIG",
                "transmission_id": "t-1",
            })))
            .with_status(200)
            .with_body(r#"{"verification_status":"SUCCESS"}"#)
            .create_async()
            .await;

        let user = UserId::new();
        let payload = json!({
            "id": "WH-EVT-1",
            "event_type": "BILLING.SUBSCRIPTION.ACTIVATED",
            "create_time": "2027-01-15T08:00:00Z",
            "resource": {
                "id": "I-SUB1",
                "status": "ACTIVE",
                "plan_id": "P-ANNUAL",
                "custom_id": user.to_string(),
                "start_time": "2027-01-15T07:59:00Z",
                "billing_info": { "next_billing_time": "2028-01-15T10:00:00Z" }
            }
        })
        .to_string();

        let provider = PayPalProvider::new(config(server.url()));
        let event = provider.confirm(&payload, &signed_headers()).await.unwrap();
        verify.assert_async().await;

        assert_eq!(event.event_id, "WH-EVT-1");
        match event.kind {
            ProviderEventKind::SubscriptionActivated(outcome) => {
                assert_eq!(outcome.user_id, Some(user));
                assert_eq!(outcome.plan, PlanTier::Annual);
                assert_eq!(outcome.provider_object_id, "I-SUB1");
                assert!(outcome.period_end.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_suspension_is_a_payment_failure_not_a_cancel() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _verify = server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .with_status(200)
            .with_body(r#"{"verification_status":"SUCCESS"}"#)
            .create_async()
            .await;

        let provider = PayPalProvider::new(config(server.url()));
        let payload = r#"{"id":"WH-3","event_type":"BILLING.SUBSCRIPTION.SUSPENDED","resource":{"id":"I-SUB1","status":"SUSPENDED"}}"#;
        let event = provider.confirm(payload, &signed_headers()).await.unwrap();
        match event.kind {
            ProviderEventKind::PaymentFailed {
                provider_object_id,
                ..
            } => assert_eq!(provider_object_id.as_deref(), Some("I-SUB1")),
            other => panic!("suspension must not cancel, got {:?}", other),
        }

        let payload = r#"{"id":"WH-4","event_type":"BILLING.SUBSCRIPTION.EXPIRED","resource":{"id":"I-SUB1","status":"EXPIRED"}}"#;
        let event = provider.confirm(payload, &signed_headers()).await.unwrap();
        assert!(matches!(event.kind, ProviderEventKind::SubscriptionCancelled { .. }));
    }

    #[tokio::test]
    async fn test_unhandled_event_type_is_passed_through() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _verify = server
            .mock("POST", "/v1/notifications/verify-webhook-signature")
            .with_status(200)
            .with_body(r#"{"verification_status":"SUCCESS"}"#)
            .create_async()
            .await;

        let provider = PayPalProvider::new(config(server.url()));
        let payload = r#"{"id":"WH-2","event_type":"CUSTOMER.DISPUTE.CREATED","resource":{}}"#;
        let event = provider.confirm(payload, &signed_headers()).await.unwrap();
        assert!(matches!(event.kind, ProviderEventKind::Unhandled { .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_provider_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _sub = server
            .mock("GET", "/v1/billing/subscriptions/I-SUB1")
            .with_status(503)
            .create_async()
            .await;

        let provider = PayPalProvider::new(config(server.url()));
        let result = provider.fetch_checkout("I-SUB1").await;
        assert!(matches!(result, Err(BillingError::ProviderUnavailable(_))));
    }

    #[tokio::test]
    async fn test_approved_order_is_captured() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server).await;
        let _order = server
            .mock("GET", "/v2/checkout/orders/ORDER1")
            .with_status(200)
            .with_body(
                r#"{"id":"ORDER1","status":"APPROVED","create_time":"2027-01-15T08:00:00Z",
                    "purchase_units":[{"custom_id":"anon:daily","amount":{"currency_code":"USD","value":"2.99"}}]}"#,
            )
            .create_async()
            .await;
        let capture = server
            .mock("POST", "/v2/checkout/orders/ORDER1/capture")
            .with_status(201)
            .with_body(r#"{"id":"ORDER1","status":"COMPLETED"}"#)
            .expect(1)
            .create_async()
            .await;

        let provider = PayPalProvider::new(config(server.url()));
        let state = provider.fetch_checkout("ORDER1").await.unwrap();
        capture.assert_async().await;

        match state {
            CheckoutState::Completed {
                purchase: Purchase::Anonymous { plan, amount_cents, .. },
                ..
            } => {
                assert_eq!(plan, PlanTier::Daily);
                assert_eq!(amount_cents, Some(299));
            }
            other => panic!("unexpected state {:?}", other),
        }
    }
}
