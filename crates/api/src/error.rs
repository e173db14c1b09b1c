//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fixitflow_billing::{BillingError, DecisionReason, PlanCatalog};
use fixitflow_shared::Capability;
use serde_json::json;

use crate::auth::AuthError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Gated capability denied; rendered as an upsell rather than a failure
    #[error("Upgrade required for {capability}")]
    UpgradeRequired {
        capability: String,
        reason: DecisionReason,
    },

    #[error("Billing is disabled")]
    BillingDisabled,

    #[error("Internal error: {0}")]
    Internal(String),
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::Validation(_)
        | BillingError::AlreadyEntitled(_)
        | BillingError::InvalidSignature
        | BillingError::TokenDecode(_)
        | BillingError::InvalidState(_) => StatusCode::BAD_REQUEST,
        BillingError::UnknownEvent(_) => StatusCode::OK,
        BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::StateConflict(_) => StatusCode::CONFLICT,
        BillingError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::StripeApi(_) | BillingError::PayPalApi(_) => StatusCode::BAD_GATEWAY,
        BillingError::Database(_)
        | BillingError::Redis(_)
        | BillingError::Config(_)
        | BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(err) => billing_status(err),
            ApiError::Auth(err) => err.status(),
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::UpgradeRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::BillingDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Billing(BillingError::StateConflict(_)) => "retry",
            ApiError::Billing(err) => err.code(),
            ApiError::Auth(_) => "unauthorized",
            ApiError::Validation(_) => "validation_error",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::UpgradeRequired { .. } => "upgrade_required",
            ApiError::BillingDisabled => "billing_disabled",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let body = match self {
            ApiError::Auth(err) => return err.into_response(),
            ApiError::UpgradeRequired { capability, reason } => {
                let plans = capability
                    .parse::<Capability>()
                    .map(PlanCatalog::plans_with)
                    .unwrap_or_default();
                json!({
                    "error": code,
                    "message": "Upgrade to a premium plan to use this feature",
                    "capability": capability,
                    "reason": reason,
                    "plans": plans,
                    "code": status.as_u16(),
                })
            }
            other if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE => {
                tracing::error!(error = %other, status = status.as_u16(), "Request failed");
                json!({
                    "error": code,
                    "message": "Internal server error",
                    "code": status.as_u16(),
                })
            }
            other => json!({
                "error": code,
                "message": other.to_string(),
                "code": status.as_u16(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Billing(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_billing_status_mapping() {
        let cases = [
            (BillingError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::AlreadyEntitled("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::InvalidSignature, StatusCode::BAD_REQUEST),
            (BillingError::UnknownEvent("x".into()), StatusCode::OK),
            (BillingError::ProviderUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (BillingError::StateConflict("x".into()), StatusCode::CONFLICT),
            (BillingError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (BillingError::Database("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[tokio::test]
    async fn test_not_eligible_body() {
        let response = ApiError::from(BillingError::AlreadyEntitled("trial used".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "not_eligible");
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_conflict_asks_for_retry() {
        let response = ApiError::from(BillingError::StateConflict("busy".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "retry");
    }

    #[tokio::test]
    async fn test_internal_details_hidden() {
        let response = ApiError::from(BillingError::Database("password=hunter2".into())).into_response();
        let body = body_json(response).await;
        assert_eq!(body["message"], "Internal server error");
    }

    #[tokio::test]
    async fn test_upgrade_required_lists_plans() {
        let response = ApiError::UpgradeRequired {
            capability: "prioritySupport".into(),
            reason: DecisionReason::UpgradeRequired,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let body = body_json(response).await;
        assert_eq!(body["error"], "upgrade_required");
        assert_eq!(body["capability"], "prioritySupport");
        assert_eq!(body["plans"], json!(["monthly", "annual"]));
    }
}
