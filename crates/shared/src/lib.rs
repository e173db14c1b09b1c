#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! FixItFlow shared types
//!
//! Identifiers, plan and status enums, and database bootstrap used by the
//! api, billing, and worker crates.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::*;
