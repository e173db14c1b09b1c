//! Authentication module for FixItFlow

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{
    optional_auth, require_admin, require_auth, AuthError, AuthState, AuthUser, MaybeAuthUser,
    RequestPrincipal, ENTITLEMENT_TOKEN_HEADER,
};
