//! Provider configuration and the Stripe client wrapper

use std::sync::Arc;
use std::time::Duration;

use fixitflow_shared::PlanTier;

use crate::error::{BillingError, BillingResult};

const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PAYPAL_API_BASE: &str = "https://api-m.sandbox.paypal.com";

fn required(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} not set", name)))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Upper bound for any single outbound provider call
pub fn provider_timeout() -> Duration {
    let secs = std::env::var("PROVIDER_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PROVIDER_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// Provider-side price (Stripe) or plan (PayPal) identifiers per paid tier
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub daily: String,
    pub monthly: String,
    pub annual: String,
}

impl PriceIds {
    pub fn for_tier(&self, tier: PlanTier) -> Option<&str> {
        let id = match tier {
            PlanTier::Free => return None,
            PlanTier::Daily => &self.daily,
            PlanTier::Monthly => &self.monthly,
            PlanTier::Annual => &self.annual,
        };
        (!id.is_empty()).then_some(id.as_str())
    }

    /// Reverse lookup used when an event carries a price id but no plan metadata
    pub fn tier_for(&self, price_id: &str) -> Option<PlanTier> {
        [PlanTier::Daily, PlanTier::Monthly, PlanTier::Annual]
            .into_iter()
            .find(|tier| self.for_tier(*tier) == Some(price_id))
    }

    fn from_env(prefix: &str) -> Self {
        Self {
            daily: optional(&format!("{}_DAILY", prefix)).unwrap_or_default(),
            monthly: optional(&format!("{}_MONTHLY", prefix)).unwrap_or_default(),
            annual: optional(&format!("{}_ANNUAL", prefix)).unwrap_or_default(),
        }
    }
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Recurring prices used for registered-user subscriptions
    pub prices: PriceIds,
    /// One-time prices used for anonymous token purchases
    pub one_time_prices: PriceIds,
    pub success_url: String,
    pub cancel_url: String,
    pub timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let prices = PriceIds::from_env("STRIPE_PRICE");
        let one_time_prices = PriceIds::from_env("STRIPE_ONE_TIME_PRICE");
        let base = optional("PUBLIC_BASE_URL").unwrap_or_else(|| "http://localhost:3000".to_string());

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            prices,
            one_time_prices,
            success_url: optional("STRIPE_SUCCESS_URL").unwrap_or_else(|| {
                format!("{}/payment-success?session_id={{CHECKOUT_SESSION_ID}}", base)
            }),
            cancel_url: optional("STRIPE_CANCEL_URL")
                .unwrap_or_else(|| format!("{}/pricing", base)),
            timeout: provider_timeout(),
        })
    }
}

/// Thin wrapper so services share one configured Stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self {
            inner,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

/// PayPal REST configuration
#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub api_base: String,
    /// Billing plan ids (`P-...`) per paid tier
    pub plan_ids: PriceIds,
    pub return_url: String,
    pub cancel_url: String,
    pub timeout: Duration,
}

impl PayPalConfig {
    pub fn from_env() -> BillingResult<Self> {
        let base = optional("PUBLIC_BASE_URL").unwrap_or_else(|| "http://localhost:3000".to_string());

        Ok(Self {
            client_id: required("PAYPAL_CLIENT_ID")?,
            client_secret: required("PAYPAL_CLIENT_SECRET")?,
            webhook_id: required("PAYPAL_WEBHOOK_ID")?,
            api_base: optional("PAYPAL_API_BASE")
                .unwrap_or_else(|| DEFAULT_PAYPAL_API_BASE.to_string()),
            plan_ids: PriceIds::from_env("PAYPAL_PLAN"),
            return_url: optional("PAYPAL_RETURN_URL")
                .unwrap_or_else(|| format!("{}/payment-success", base)),
            cancel_url: optional("PAYPAL_CANCEL_URL")
                .unwrap_or_else(|| format!("{}/pricing", base)),
            timeout: provider_timeout(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn prices() -> PriceIds {
        PriceIds {
            daily: "price_daily".into(),
            monthly: "price_monthly".into(),
            annual: String::new(),
        }
    }

    #[test]
    fn test_price_lookup_both_directions() {
        let ids = prices();
        assert_eq!(ids.for_tier(PlanTier::Daily), Some("price_daily"));
        assert_eq!(ids.for_tier(PlanTier::Free), None);
        assert_eq!(ids.for_tier(PlanTier::Annual), None, "unset price is not usable");
        assert_eq!(ids.tier_for("price_monthly"), Some(PlanTier::Monthly));
        assert_eq!(ids.tier_for("price_other"), None);
    }

    #[test]
    #[serial]
    fn test_provider_timeout_from_env() {
        std::env::set_var("PROVIDER_TIMEOUT_SECS", "3");
        assert_eq!(provider_timeout(), Duration::from_secs(3));
        std::env::set_var("PROVIDER_TIMEOUT_SECS", "not-a-number");
        assert_eq!(provider_timeout(), Duration::from_secs(10));
        std::env::remove_var("PROVIDER_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_stripe_config_requires_secret() {
        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test");
        assert!(matches!(StripeConfig::from_env(), Err(BillingError::Config(_))));
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");
    }
}
