//! Rate-Limit Registry (spec §4.E): holds one token-bucket limiter per
//! table, keyed by table name, and exposes a blocking `acquire` that
//! resolves once a token is available. Buckets are created lazily on first
//! `acquire` for a key, using whichever `calls_per_minute` the caller
//! supplies at that moment — later callers for the same key reuse the
//! bucket already in place.
//!
//! Built on `governor`'s GCRA limiter rather than a hand-rolled bucket:
//! GCRA approximates a uniform-rate token bucket closely enough for the
//! sliding-window guarantee the spec asks for, and waiters on a single
//! limiter are served in arrival order.

use std::num::NonZeroU32;
use std::sync::Arc;

use dashmap::DashMap;
use governor::{Quota, RateLimiter};

type Limiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Per-table token-bucket limiters, created on demand.
pub struct RateLimitRegistry {
    limiters: DashMap<String, Arc<Limiter>>,
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitRegistry {
    pub fn new() -> Self {
        Self { limiters: DashMap::new() }
    }

    /// Blocks until a token is available for `key`, then returns. Creates
    /// the bucket for `key` on first use with `calls_per_minute` tokens per
    /// minute; the quota is fixed for the lifetime of the bucket.
    pub async fn acquire(&self, key: &str, calls_per_minute: u32) {
        let limiter = self.limiter_for(key, calls_per_minute);
        limiter.until_ready().await;
    }

    fn limiter_for(&self, key: &str, calls_per_minute: u32) -> Arc<Limiter> {
        if let Some(existing) = self.limiters.get(key) {
            return existing.clone();
        }
        let quota = Quota::per_minute(NonZeroU32::new(calls_per_minute.max(1)).unwrap());
        self.limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::direct(quota)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    // 120/minute gives a 500ms refill interval per token: fast enough to
    // exercise the waiting path without a slow test.
    const FAST_QUOTA: u32 = 120;

    #[tokio::test]
    async fn bucket_exhausts_its_burst_then_waits_for_refill() {
        let registry = RateLimitRegistry::new();
        for _ in 0..FAST_QUOTA {
            registry.acquire("daily", FAST_QUOTA).await;
        }

        let start = Instant::now();
        registry.acquire("daily", FAST_QUOTA).await;
        assert!(start.elapsed() >= Duration::from_millis(350), "acquire past the burst should wait for a refill");
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_buckets() {
        let registry = RateLimitRegistry::new();
        registry.acquire("daily", 1).await; // drains "daily"'s single-token bucket

        let start = Instant::now();
        // A different key with a generous quota must not be throttled by
        // "daily" having just exhausted its own bucket.
        registry.acquire("instruments", 1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn bucket_quota_is_fixed_on_first_use() {
        let registry = RateLimitRegistry::new();
        for _ in 0..FAST_QUOTA {
            registry.acquire("income_statement", FAST_QUOTA).await;
        }

        // A later call with a far larger quota is ignored: the bucket
        // already exists and keeps its original capacity.
        let start = Instant::now();
        registry.acquire("income_statement", 1_000_000).await;
        assert!(start.elapsed() >= Duration::from_millis(350));
    }
}
