//! Redis-compatible shared cache.
//!
//! The gateway's cross-cutting state (rate-limit windows, the token
//! revocation set, token/user/session caches, cached responses) lives in
//! a key/value store with TTLs, sorted sets, and atomic pipelines. The
//! [`CacheBackend`] trait abstracts the store; production deployments use
//! the Redis backend, tests and single-node setups the in-process one.
//!
//! Cache failures are typed and recoverable: callers apply their own
//! fallback policy (the rate limiter fails open, the token validator
//! falls back to full verification, the response cache treats errors as
//! misses).

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Cache key layout shared with the rest of the platform.
pub mod keys {
    pub fn rate_limit(identifier: &str, endpoint: &str) -> String {
        format!("rate_limit:{identifier}:{endpoint}")
    }

    pub fn blacklisted_token(jti: &str) -> String {
        format!("blacklisted_token:{jti}")
    }

    pub fn token(hash: &str) -> String {
        format!("auth:token:{hash}")
    }

    pub fn user(user_id: &str) -> String {
        format!("auth:user:{user_id}")
    }

    pub fn session(session_id: &str) -> String {
        format!("auth:session:{session_id}")
    }

    pub fn response(hash: &str) -> String {
        format!("gateway:response:{hash}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backend could not be reached.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    /// The backend answered but the operation failed.
    #[error("cache operation failed: {0}")]
    Operation(String),
}

/// Outcome of the atomic sliding-window admission pipeline.
#[derive(Debug, Clone, Copy)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Members in the window after this request was considered.
    pub current_count: u64,
    /// Score (epoch millis) of the oldest member, for `Retry-After`.
    pub oldest_score_ms: Option<i64>,
}

/// Object-safe async cache operations.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;

    /// Executes the sliding-window admission decision atomically:
    /// prune members older than the window, add `member` at `now_ms`,
    /// count, and refresh the key TTL. A rejected member is removed
    /// again so rejected traffic does not consume window budget.
    async fn rate_limit_window(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> Result<WindowDecision, CacheError>;
}

/// Cloneable handle to the configured backend.
#[derive(Clone)]
pub struct SharedCache {
    backend: Arc<dyn CacheBackend>,
}

impl SharedCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// In-process backend, used by tests and single-node deployments.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    /// Connects to Redis; the connection manager reconnects on its own.
    pub async fn connect_redis(url: &str) -> Result<Self, CacheError> {
        Ok(Self::new(Arc::new(RedisCache::connect(url).await?)))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.backend.get(key).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.backend.set_ex(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.backend.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.backend.exists(key).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        self.backend.expire(key, ttl).await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }

    pub async fn rate_limit_window(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> Result<WindowDecision, CacheError> {
        self.backend
            .rate_limit_window(key, member, now_ms, window_ms, limit)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(keys::rate_limit("u1", "/api/v1/users/:id"), "rate_limit:u1:/api/v1/users/:id");
        assert_eq!(keys::blacklisted_token("abc"), "blacklisted_token:abc");
        assert_eq!(keys::token("deadbeef"), "auth:token:deadbeef");
        assert_eq!(keys::user("u1"), "auth:user:u1");
        assert_eq!(keys::session("s1"), "auth:session:s1");
    }
}
