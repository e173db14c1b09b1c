//! Billing email delivery through Resend

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::notify::NotificationTemplate;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from: String,
    pub api_url: String,
}

impl EmailConfig {
    /// `None` when `RESEND_API_KEY` is unset; email is then skipped
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty())?;
        Some(Self {
            api_key,
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "FixItFlow <billing@fixitflow.app>".to_string()),
            api_url: RESEND_API_URL.to_string(),
        })
    }
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Option<Self> {
        match EmailConfig::from_env() {
            Some(config) => Some(Self::new(config)),
            None => {
                tracing::warn!("Billing emails not configured (missing RESEND_API_KEY)");
                None
            }
        }
    }

    pub async fn send(&self, to: &str, subject: &str, text: &str) -> BillingResult<()> {
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&ResendEmail {
                from: &self.config.from,
                to: [to],
                subject,
                text,
            })
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("email send: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Internal(format!(
                "email provider returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }

    pub async fn send_template(
        &self,
        to: &str,
        template: NotificationTemplate,
        data: &serde_json::Value,
    ) -> BillingResult<()> {
        let (subject, text) = render(template, data);
        self.send(to, &subject, &text).await
    }
}

/// Plain-text subject and body for each notification
pub fn render(template: NotificationTemplate, data: &serde_json::Value) -> (String, String) {
    let plan = data.get("plan").and_then(|v| v.as_str()).unwrap_or("premium");
    let days = data.get("days_remaining").and_then(|v| v.as_i64()).unwrap_or(0);

    match template {
        NotificationTemplate::TrialStarted => (
            "Your FixItFlow trial has started".to_string(),
            "You now have full premium access for 7 days.".to_string(),
        ),
        NotificationTemplate::SubscriptionGranted => (
            "Your FixItFlow subscription is active".to_string(),
            format!("Thanks for subscribing. Your {} plan is now active.", plan),
        ),
        NotificationTemplate::SubscriptionRenewed => (
            "Your FixItFlow subscription renewed".to_string(),
            format!("Your {} plan has been renewed.", plan),
        ),
        NotificationTemplate::ExpiryWarning => (
            "Your FixItFlow access ends soon".to_string(),
            format!("Your premium access ends in {} day(s).", days),
        ),
        NotificationTemplate::SubscriptionExpired => (
            "Your FixItFlow premium access has ended".to_string(),
            "Your plan has expired and your account is back on the free plan.".to_string(),
        ),
        NotificationTemplate::SubscriptionCancelled => (
            "Your FixItFlow subscription was cancelled".to_string(),
            "Your subscription has been cancelled and premium access has ended.".to_string(),
        ),
        NotificationTemplate::PaymentFailed => (
            "We couldn't process your FixItFlow payment".to_string(),
            "Your latest payment failed. Your provider will retry; please check your payment method."
                .to_string(),
        ),
    }
}
