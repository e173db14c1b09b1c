//! Authentication middleware for Axum

use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
        HeaderMap, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use fixitflow_billing::Principal;
use fixitflow_shared::UserId;
use serde_json::json;

use super::jwt::JwtManager;

/// Header carrying an anonymous entitlement token
pub const ENTITLEMENT_TOKEN_HEADER: &str = "x-entitlement-token";

const AUTH_COOKIE: &str = "fixitflow_auth_token";

/// Authenticated user extracted from the session JWT
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: Option<String>,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

fn extract_token_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .find_map(|cookie| cookie.trim().strip_prefix(AUTH_COOKIE)?.strip_prefix('='))
                .map(String::from)
        })
}

/// Bearer token from the Authorization header, falling back to the session cookie
fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(header) = headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    extract_token_from_cookie(headers)
}

fn authenticate(auth_state: &AuthState, headers: &HeaderMap) -> Result<AuthUser, AuthError> {
    let token = extract_bearer_token(headers).ok_or(AuthError::MissingAuth)?;
    let claims = auth_state.jwt_manager.validate_token(&token)?;
    Ok(AuthUser {
        user_id: UserId(claims.sub),
        email: claims.email,
        role: claims.role,
    })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    match authenticate(&auth_state, request.headers()) {
        Ok(auth_user) => {
            tracing::debug!(path = %path, user_id = %auth_user.user_id, "Request authenticated");
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::info!(path = %path, error = %err, "Authentication failed");
            err.into_response()
        }
    }
}

/// Middleware that authenticates when credentials are present. Invalid
/// credentials are treated as none; handlers fall back to the anonymous
/// token or guest.
pub async fn optional_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Ok(auth_user) = authenticate(&auth_state, request.headers()) {
        request.extensions_mut().insert(auth_user);
    }
    next.run(request).await
}

/// Runs after `require_auth`; rejects non-admin users
pub async fn require_admin(request: Request, next: Next) -> Response {
    let caller = request
        .extensions()
        .get::<AuthUser>()
        .map(|user| (user.user_id, user.is_admin()));

    match caller {
        Some((_, true)) => next.run(request).await,
        Some((user_id, false)) => {
            tracing::warn!(user_id = %user_id, path = %request.uri().path(), "Admin route denied");
            AuthError::InsufficientPermissions.into_response()
        }
        None => AuthError::MissingAuth.into_response(),
    }
}

/// Who is asking, resolved from the request: the authenticated user, else an
/// anonymous entitlement token, else a guest. Never rejects.
#[derive(Debug, Clone)]
pub struct RequestPrincipal(pub Principal);

impl<S> FromRequestParts<S> for RequestPrincipal
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthUser>() {
            return Ok(Self(Principal::Registered { user_id: user.user_id }));
        }

        let token = parts
            .headers
            .get(ENTITLEMENT_TOKEN_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty());

        Ok(Self(match token {
            Some(token) => Principal::Anonymous {
                token: token.to_string(),
            },
            None => Principal::Guest,
        }))
    }
}

/// The authenticated user, if `optional_auth` found one
#[derive(Debug, Clone)]
pub struct MaybeAuthUser(pub Option<AuthUser>);

impl<S> FromRequestParts<S> for MaybeAuthUser
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<AuthUser>().cloned()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Insufficient permissions")]
    InsufficientPermissions,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingAuth | AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::InsufficientPermissions => StatusCode::FORBIDDEN,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, message) = match self {
            AuthError::MissingAuth => ("unauthorized", "Authentication required"),
            AuthError::InvalidToken => ("unauthorized", "Invalid or expired token"),
            AuthError::InsufficientPermissions => ("forbidden", "Insufficient permissions"),
            AuthError::Internal(_) => ("internal_error", "Internal server error"),
        };

        let body = Json(json!({
            "error": error,
            "message": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
