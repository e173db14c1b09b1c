//! Daily usage counters for free-tier allowances
//!
//! Counters are keyed per user, capability, and UTC day, and expire on their
//! own shortly after the day ends. Redis backs multi-instance deployments;
//! the in-memory store is for single-process runs and tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fixitflow_shared::{Capability, UserId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::BillingResult;

/// Hard cap on in-memory counters before expired entries are purged inline
const MAX_MEMORY_ENTRIES: usize = 100_000;

/// Slack after midnight before a day's counter is dropped
const EXPIRY_GRACE_SECS: u64 = 3_600;

pub fn usage_key(user_id: UserId, capability: Capability, now: OffsetDateTime) -> String {
    format!("usage:{}:{}:{}", user_id, capability, now.date())
}

/// Time left until the counter for `now`'s day can be forgotten
pub fn ttl_for_day(now: OffsetDateTime) -> Duration {
    let elapsed = u64::from(now.time().hour()) * 3_600
        + u64::from(now.time().minute()) * 60
        + u64::from(now.time().second());
    Duration::from_secs(86_400 - elapsed + EXPIRY_GRACE_SECS)
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get(&self, key: &str) -> BillingResult<u32>;

    /// Atomically add one and return the new count
    async fn increment(&self, key: &str, ttl: Duration) -> BillingResult<u32>;

    /// Drop expired counters; returns how many were removed
    async fn cleanup(&self) -> BillingResult<usize> {
        Ok(0)
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Default)]
pub struct MemoryUsageStore {
    counters: RwLock<HashMap<String, (u32, Instant)>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn get(&self, key: &str) -> BillingResult<u32> {
        let now = Instant::now();
        Ok(self
            .counters
            .read()
            .await
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(count, _)| *count)
            .unwrap_or(0))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> BillingResult<u32> {
        let now = Instant::now();
        let mut counters = self.counters.write().await;

        if counters.len() >= MAX_MEMORY_ENTRIES {
            counters.retain(|_, (_, expires)| *expires > now);
        }

        let entry = counters.entry(key.to_string()).or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn cleanup(&self) -> BillingResult<usize> {
        let now = Instant::now();
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|_, (_, expires)| *expires > now);
        Ok(before - counters.len())
    }
}

// =============================================================================
// Redis
// =============================================================================

#[derive(Clone)]
pub struct RedisUsageStore {
    conn: ConnectionManager,
}

impl RedisUsageStore {
    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    async fn get(&self, key: &str) -> BillingResult<u32> {
        let mut conn = self.conn.clone();
        let count: Option<u32> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> BillingResult<u32> {
        let mut conn = self.conn.clone();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let (count, _): (u32, i64) = redis::pipe()
            .atomic()
            .incr(key, 1u32)
            .expire(key, ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
