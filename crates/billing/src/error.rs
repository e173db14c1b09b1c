//! Billing errors

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    /// The principal already holds (or already used) what they asked for
    #[error("Not eligible: {0}")]
    AlreadyEntitled(String),

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Unhandled webhook event: {0}")]
    UnknownEvent(String),

    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid entitlement token: {0}")]
    TokenDecode(String),

    /// Optimistic lock lost more than once in a row
    #[error("Concurrent modification: {0}")]
    StateConflict(String),

    #[error("Invalid subscription state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("PayPal API error: {0}")]
    PayPalApi(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Errors worth retrying: the provider or backing store may recover
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::Database(_) | Self::Redis(_) | Self::StateConflict(_)
        )
    }

    /// Short machine-readable code used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::AlreadyEntitled(_) => "not_eligible",
            Self::InvalidSignature => "invalid_signature",
            Self::UnknownEvent(_) => "unknown_event",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::TokenDecode(_) => "invalid_token",
            Self::StateConflict(_) => "state_conflict",
            Self::InvalidState(_) => "invalid_state",
            Self::NotFound(_) => "not_found",
            Self::Database(_) => "database_error",
            Self::Redis(_) => "cache_error",
            Self::Config(_) => "configuration_error",
            Self::StripeApi(_) => "stripe_error",
            Self::PayPalApi(_) => "paypal_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Timeout => Self::ProviderUnavailable("stripe timed out".to_string()),
            other => Self::StripeApi(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::ProviderUnavailable(err.to_string())
        } else {
            Self::PayPalApi(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BillingError::ProviderUnavailable("x".into()).is_transient());
        assert!(BillingError::StateConflict("x".into()).is_transient());
        assert!(!BillingError::InvalidSignature.is_transient());
        assert!(!BillingError::AlreadyEntitled("x".into()).is_transient());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
