//! Fixed-window rate limiting backed by a persistent counter.
//!
//! Each [`RateLimiter`] guards one logical resource (admin API, developer
//! API, homeowner chat, training, ...) with its own `max_requests` per
//! `window_secs`. Counters live in a [`RateLimitStore`]; the only write is a
//! single atomic upsert that either starts a fresh window or increments the
//! current one, so concurrent requests for the same key never race through
//! a read-then-write gap.
//!
//! If the store is unreachable the limiter fails open: the request is
//! allowed and the error is logged.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{LimitConfig, RateLimitsConfig, MAX_WINDOW_SECS};

/// Counter state after a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    /// End of the current window, epoch milliseconds.
    pub reset_at: i64,
}

/// Persistent backing for rate-limit counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically registers one request for `key` and returns the new state.
    ///
    /// Starts a new window (`count = 1`, `reset_at = now + window`) when no
    /// entry exists or the stored window ended before `now_ms`; otherwise
    /// increments the count.
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<RateLimitEntry>;

    /// Removes the counter for `key`.
    async fn reset(&self, key: &str) -> Result<()>;
}

/// SQLite-backed counters in the `rate_limits` table.
pub struct SqliteRateLimitStore {
    pool: SqlitePool,
}

impl SqliteRateLimitStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for SqliteRateLimitStore {
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<RateLimitEntry> {
        let new_reset = now_ms + window_ms;
        let (count, reset_at): (i64, i64) = sqlx::query_as(
            r#"
            INSERT INTO rate_limits (key, count, reset_at) VALUES (?, 1, ?)
            ON CONFLICT(key) DO UPDATE SET
                count = CASE WHEN rate_limits.reset_at < ? THEN 1 ELSE rate_limits.count + 1 END,
                reset_at = CASE WHEN rate_limits.reset_at < ? THEN excluded.reset_at ELSE rate_limits.reset_at END
            RETURNING count, reset_at
            "#,
        )
        .bind(key)
        .bind(new_reset)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;

        Ok(RateLimitEntry {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            reset_at,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_limits WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local counters for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<RateLimitEntry> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("rate limit table poisoned"))?;
        let entry = entries
            .entry(key.to_string())
            .and_modify(|e| {
                if e.reset_at < now_ms {
                    e.count = 1;
                    e.reset_at = now_ms + window_ms;
                } else {
                    e.count = e.count.saturating_add(1);
                }
            })
            .or_insert(RateLimitEntry {
                count: 1,
                reset_at: now_ms + window_ms,
            });
        Ok(*entry)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("rate limit table poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Value for the `X-RateLimit-Reset` header.
    pub fn reset_at_millis(&self) -> i64 {
        self.reset_at.timestamp_millis()
    }
}

/// Builds the composite key for a scope (tenant, unit, ip) and resource.
pub fn rate_limit_key(scope: &str, resource: &str) -> String {
    format!("{}:{}", scope, resource)
}

/// A named fixed-window limiter.
#[derive(Clone)]
pub struct RateLimiter {
    name: &'static str,
    limit: LimitConfig,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: LimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self { name, limit, store }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn max_requests(&self) -> u32 {
        self.limit.max_requests
    }

    /// Keys are namespaced by limiter so two limiters sharing a caller key
    /// keep separate counters.
    fn store_key(&self, key: &str) -> String {
        format!("{}|{}", self.name, key)
    }

    /// Configured window, clamped to [`MAX_WINDOW_SECS`].
    fn window(&self) -> Duration {
        Duration::seconds(self.limit.window_secs.min(MAX_WINDOW_SECS) as i64)
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Utc::now()).await
    }

    /// [`check`](Self::check) against an explicit clock.
    pub async fn check_at(&self, key: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let window = self.window();
        let now_ms = now.timestamp_millis();
        let window_ms = window.num_milliseconds();

        match self.store.hit(&self.store_key(key), now_ms, window_ms).await {
            Ok(entry) => {
                let reset_at =
                    DateTime::<Utc>::from_timestamp_millis(entry.reset_at).unwrap_or(now + window);
                if entry.count > self.limit.max_requests {
                    tracing::debug!(limiter = self.name, key, count = entry.count, "rate limited");
                    RateLimitDecision {
                        allowed: false,
                        remaining: 0,
                        reset_at,
                    }
                } else {
                    RateLimitDecision {
                        allowed: true,
                        remaining: self.limit.max_requests - entry.count,
                        reset_at,
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    limiter = self.name,
                    key,
                    error = %e,
                    "rate limit store unavailable, allowing request"
                );
                RateLimitDecision {
                    allowed: true,
                    remaining: self.limit.max_requests,
                    reset_at: now + window,
                }
            }
        }
    }

    pub async fn reset(&self, key: &str) -> Result<()> {
        self.store.reset(&self.store_key(key)).await
    }
}

/// Checks `primary` first and only charges `burst` when the primary allows.
///
/// When both allow, the decision with fewer remaining requests is returned.
pub async fn check_compound(
    primary: &RateLimiter,
    burst: &RateLimiter,
    key: &str,
) -> RateLimitDecision {
    let first = primary.check(key).await;
    if !first.allowed {
        return first;
    }
    let second = burst.check(key).await;
    if !second.allowed || second.remaining < first.remaining {
        second
    } else {
        first
    }
}

/// Every limiter the service uses, sharing one store.
#[derive(Clone)]
pub struct RateLimiters {
    pub admin: RateLimiter,
    pub developer: RateLimiter,
    pub developer_burst: RateLimiter,
    pub homeowner: RateLimiter,
    pub ip: RateLimiter,
    pub chat: RateLimiter,
    pub train: RateLimiter,
    pub upload: RateLimiter,
}

impl RateLimiters {
    pub fn from_config(config: &RateLimitsConfig, store: Arc<dyn RateLimitStore>) -> Self {
        let make = |name, limit| RateLimiter::new(name, limit, store.clone());
        Self {
            admin: make("admin", config.admin),
            developer: make("developer", config.developer),
            developer_burst: make("developer_burst", config.developer_burst),
            homeowner: make("homeowner", config.homeowner),
            ip: make("ip", config.ip),
            chat: make("chat", config.chat),
            train: make("train", config.train),
            upload: make("upload", config.upload),
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&RateLimiter> {
        match name {
            "admin" => Some(&self.admin),
            "developer" => Some(&self.developer),
            "developer_burst" => Some(&self.developer_burst),
            "homeowner" => Some(&self.homeowner),
            "ip" => Some(&self.ip),
            "chat" => Some(&self.chat),
            "train" => Some(&self.train),
            "upload" => Some(&self.upload),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            "test",
            LimitConfig {
                max_requests: max,
                window_secs,
            },
            Arc::new(MemoryRateLimitStore::new()),
        )
    }

    struct BrokenStore;

    #[async_trait]
    impl RateLimitStore for BrokenStore {
        async fn hit(&self, _key: &str, _now_ms: i64, _window_ms: i64) -> Result<RateLimitEntry> {
            anyhow::bail!("connection refused")
        }
        async fn reset(&self, _key: &str) -> Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn oversized_window_is_clamped() {
        let l = limiter(2, 10_000_000_000_000_000);
        let now = Utc::now();

        let d = l.check_at("k", now).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
        let max_ms = i64::try_from(MAX_WINDOW_SECS).unwrap() * 1000;
        assert_eq!(d.reset_at_millis(), now.timestamp_millis() + max_ms);
    }

    #[tokio::test]
    async fn allows_up_to_max_then_rejects() {
        let rl = limiter(3, 60);
        let now = Utc::now();
        for expected_remaining in [2, 1, 0] {
            let d = rl.check_at("t1:train", now).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }
        let d = rl.check_at("t1:train", now).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn expired_window_resets_count() {
        let rl = limiter(2, 60);
        let start = Utc::now();
        for _ in 0..5 {
            rl.check_at("k", start).await;
        }
        assert!(!rl.check_at("k", start).await.allowed);

        let later = start + Duration::seconds(61);
        let d = rl.check_at("k", later).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
        assert_eq!(d.reset_at.timestamp_millis(), (later + Duration::seconds(60)).timestamp_millis());
    }

    #[tokio::test]
    async fn reset_at_is_stable_within_window() {
        let rl = limiter(5, 60);
        let start = Utc::now();
        let first = rl.check_at("k", start).await;
        let second = rl.check_at("k", start + Duration::seconds(10)).await;
        assert_eq!(first.reset_at, second.reset_at);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let rl = limiter(1, 60);
        let now = Utc::now();
        assert!(rl.check_at("a", now).await.allowed);
        assert!(!rl.check_at("a", now).await.allowed);
        assert!(rl.check_at("b", now).await.allowed);
    }

    #[tokio::test]
    async fn reset_clears_counter() {
        let rl = limiter(1, 60);
        assert!(rl.check("a").await.allowed);
        assert!(!rl.check("a").await.allowed);
        rl.reset("a").await.unwrap();
        assert!(rl.check("a").await.allowed);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let rl = RateLimiter::new(
            "broken",
            LimitConfig {
                max_requests: 1,
                window_secs: 60,
            },
            Arc::new(BrokenStore),
        );
        for _ in 0..3 {
            let d = rl.check("k").await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 1);
        }
    }

    #[tokio::test]
    async fn compound_does_not_charge_burst_on_primary_rejection() {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryRateLimitStore::new());
        let primary = RateLimiter::new(
            "developer",
            LimitConfig {
                max_requests: 1,
                window_secs: 60,
            },
            store.clone(),
        );
        let burst = RateLimiter::new(
            "developer_burst",
            LimitConfig {
                max_requests: 2,
                window_secs: 60,
            },
            store.clone(),
        );

        assert!(check_compound(&primary, &burst, "t1").await.allowed);
        for _ in 0..5 {
            assert!(!check_compound(&primary, &burst, "t1").await.allowed);
        }

        // Burst was charged exactly once: one request left.
        let d = burst.check("t1").await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn limiters_share_store_without_key_collisions() {
        let limits = RateLimitsConfig::default();
        let limiters = RateLimiters::from_config(&limits, Arc::new(MemoryRateLimitStore::new()));
        let a = limiters.chat.check("unit-1").await;
        let b = limiters.homeowner.check("unit-1").await;
        assert_eq!(a.remaining, limits.chat.max_requests - 1);
        assert_eq!(b.remaining, limits.homeowner.max_requests - 1);
        assert!(limiters.by_name("train").is_some());
        assert!(limiters.by_name("nope").is_none());
    }

    #[test]
    fn composite_key_format() {
        assert_eq!(rate_limit_key("tenant-9", "train"), "tenant-9:train");
    }
}
