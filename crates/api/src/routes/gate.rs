//! Capability gate for content routes

use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use fixitflow_billing::{Decision, DecisionReason, Principal};

use crate::{
    auth::RequestPrincipal,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Turn a denied decision into the error the client renders
pub fn denial(decision: Decision) -> ApiError {
    match decision.reason {
        DecisionReason::UnknownCapability => {
            ApiError::Validation(format!("Unknown capability '{}'", decision.capability))
        }
        reason => ApiError::UpgradeRequired {
            capability: decision.capability,
            reason,
        },
    }
}

/// Allow the request through only if `principal` may use `capability` now
pub async fn require_capability(state: &AppState, principal: &Principal, capability: &str) -> ApiResult<Decision> {
    let decision = state.billing()?.entitlements.can_use(principal, capability).await?;
    if decision.allowed {
        Ok(decision)
    } else {
        tracing::debug!(capability = %capability, reason = ?decision.reason, "Capability gate denied");
        Err(denial(decision))
    }
}

#[derive(Clone)]
pub struct CapabilityGate {
    state: AppState,
    capability: &'static str,
}

async fn capability_gate(
    State(gate): State<CapabilityGate>,
    RequestPrincipal(principal): RequestPrincipal,
    request: Request,
    next: Next,
) -> Response {
    match require_capability(&gate.state, &principal, gate.capability).await {
        Ok(_) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

/// Gate every route in `router` behind `capability`. Layer `optional_auth`
/// outside this so signed-in users are recognised.
pub fn gated(router: Router<AppState>, state: &AppState, capability: &'static str) -> Router<AppState> {
    router.route_layer(middleware::from_fn_with_state(
        CapabilityGate {
            state: state.clone(),
            capability,
        },
        capability_gate,
    ))
}
