//! Sliding-window rate limiting over the shared cache.
//!
//! Admission is keyed by `(identifier, endpoint)` where the identifier
//! is the authenticated user id or the client IP, and the endpoint is
//! the matched route's pattern rather than the raw path, so
//! `/api/v1/users/1` and `/api/v1/users/2` share one window.
//!
//! On cache unavailability the limiter fails open and records a
//! warning: availability wins over strict enforcement here.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use log::warn;
use uuid::Uuid;

use crate::cache::{keys, SharedCache};

/// Outcome handed to the pipeline and reflected in `X-RateLimit-*`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub current_count: u64,
    pub limit: u32,
    pub window_seconds: u64,
    /// Seconds until the oldest window member ages out. Zero when
    /// the request was admitted.
    pub retry_after: u64,
}

impl RateLimitDecision {
    pub fn remaining(&self) -> u64 {
        (self.limit as u64).saturating_sub(self.current_count)
    }
}

pub struct RateLimiter {
    cache: SharedCache,
    /// Monotonic member prefix; combined with a UUID so members can
    /// never collide within a window, even at identical timestamps.
    member_seq: AtomicU64,
}

impl RateLimiter {
    pub fn new(cache: SharedCache) -> Self {
        Self {
            cache,
            member_seq: AtomicU64::new(0),
        }
    }

    pub async fn check(
        &self,
        identifier: &str,
        endpoint: &str,
        limit: u32,
        window_seconds: u64,
    ) -> RateLimitDecision {
        let key = keys::rate_limit(identifier, endpoint);
        let member = format!(
            "{}-{}",
            self.member_seq.fetch_add(1, Ordering::Relaxed),
            Uuid::new_v4()
        );
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = (window_seconds as i64) * 1000;

        match self
            .cache
            .rate_limit_window(&key, &member, now_ms, window_ms, limit as u64)
            .await
        {
            Ok(decision) => {
                let retry_after = if decision.allowed {
                    0
                } else {
                    decision
                        .oldest_score_ms
                        .map(|oldest| {
                            let elapsed_ms = (now_ms - oldest).max(0);
                            let remaining_ms = (window_ms - elapsed_ms).max(0);
                            // Round up so clients never retry early.
                            ((remaining_ms + 999) / 1000) as u64
                        })
                        .unwrap_or(window_seconds)
                        .clamp(1, window_seconds)
                };
                RateLimitDecision {
                    allowed: decision.allowed,
                    current_count: decision.current_count,
                    limit,
                    window_seconds,
                    retry_after,
                }
            }
            Err(e) => {
                // Fail open: a cache outage must not take ingress down.
                warn!("Rate limit check failed for {key}, admitting request: {e}");
                RateLimitDecision {
                    allowed: true,
                    current_count: 0,
                    limit,
                    window_seconds,
                    retry_after: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, CacheError, WindowDecision};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects_with_retry_after() {
        let limiter = RateLimiter::new(SharedCache::memory());

        for i in 0..2 {
            let decision = limiter.check("10.0.0.1", "/api/v1/users/:id", 2, 60).await;
            assert!(decision.allowed, "request {i} should pass");
        }

        let decision = limiter.check("10.0.0.1", "/api/v1/users/:id", 2, 60).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining(), 0);
        assert!(decision.retry_after >= 1 && decision.retry_after <= 60);
    }

    #[tokio::test]
    async fn windows_are_isolated_per_identifier_and_endpoint() {
        let limiter = RateLimiter::new(SharedCache::memory());

        assert!(limiter.check("10.0.0.1", "/a", 1, 60).await.allowed);
        assert!(!limiter.check("10.0.0.1", "/a", 1, 60).await.allowed);

        // Different identifier, different endpoint: fresh windows.
        assert!(limiter.check("10.0.0.2", "/a", 1, 60).await.allowed);
        assert!(limiter.check("10.0.0.1", "/b", 1, 60).await.allowed);
    }

    struct BrokenCache;

    #[async_trait]
    impl CacheBackend for BrokenCache {
        async fn get(&self, _: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn set_ex(&self, _: &str, _: &str, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn exists(&self, _: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn rate_limit_window(
            &self,
            _: &str,
            _: &str,
            _: i64,
            _: i64,
            _: u64,
        ) -> Result<WindowDecision, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn fails_open_when_the_cache_is_unreachable() {
        let limiter = RateLimiter::new(SharedCache::new(Arc::new(BrokenCache)));
        for _ in 0..10 {
            let decision = limiter.check("10.0.0.1", "/a", 1, 60).await;
            assert!(decision.allowed);
        }
    }
}
