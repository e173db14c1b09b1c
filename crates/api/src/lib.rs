// API crate clippy configuration
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! FixItFlow API Library
//!
//! HTTP surface over the billing engine: plans, trials, checkout, the
//! entitlement gate, provider webhooks, and admin support tooling.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::{create_router, gated, require_capability};
pub use state::AppState;
