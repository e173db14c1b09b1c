//! Application state

use std::sync::Arc;

use fixitflow_billing::{BillingService, InvariantChecker, MemoryUsageStore, RedisUsageStore, UsageStore};
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
    error::{ApiError, ApiResult},
};

/// Session JWTs are issued elsewhere; this only bounds tokens minted by tooling
const JWT_EXPIRY_HOURS: i64 = 24;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// `None` when billing is disabled or failed to initialise
    pub billing: Option<BillingService>,
    pub invariants: Option<Arc<InvariantChecker>>,
}

async fn usage_store(config: &Config) -> Arc<dyn UsageStore> {
    let Some(url) = &config.redis_url else {
        tracing::info!("REDIS_URL not set; free-tier usage counted in memory");
        return Arc::new(MemoryUsageStore::new());
    };

    match RedisUsageStore::connect(url).await {
        Ok(store) => {
            tracing::info!("Usage counters backed by Redis");
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable; free-tier usage counted in memory");
            Arc::new(MemoryUsageStore::new())
        }
    }
}

impl AppState {
    pub async fn new(pool: PgPool, config: Config) -> Self {
        let billing = if config.enable_billing {
            let usage = usage_store(&config).await;
            match BillingService::from_env(pool.clone(), usage, config.token_signing_secret.as_bytes().to_vec()) {
                Ok(svc) => {
                    tracing::info!(providers = ?svc.providers.configured(), "Billing service initialized");
                    Some(svc)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Billing not configured");
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        let mut state = Self::with_billing(config, billing);
        state.invariants = Some(Arc::new(InvariantChecker::new(pool)));
        state
    }

    /// State over an already-built billing service
    pub fn with_billing(config: Config, billing: Option<BillingService>) -> Self {
        Self {
            jwt_manager: JwtManager::new(&config.jwt_secret, JWT_EXPIRY_HOURS),
            config,
            billing,
            invariants: None,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing.as_ref().ok_or(ApiError::BillingDisabled)
    }

    pub fn invariants(&self) -> ApiResult<&InvariantChecker> {
        self.invariants.as_deref().ok_or(ApiError::BillingDisabled)
    }
}
