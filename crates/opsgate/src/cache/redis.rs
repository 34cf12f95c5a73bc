//! Redis cache backend.
//!
//! Uses a `ConnectionManager`, which multiplexes one connection and
//! reconnects with backoff on its own. The sliding-window admission runs
//! as a single MULTI/EXEC pipeline so concurrent gateways see a
//! serialized view of the window.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CacheBackend, CacheError, WindowDecision};

pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self { conn })
    }
}

fn map_err(e: redis::RedisError) -> CacheError {
    if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
        CacheError::Unavailable(e.to_string())
    } else {
        CacheError::Operation(e.to_string())
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(map_err)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(map_err)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(map_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: bool = conn
            .expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn rate_limit_window(
        &self,
        key: &str,
        member: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> Result<WindowDecision, CacheError> {
        let mut conn = self.conn.clone();
        let window_start = now_ms - window_ms;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(window_start)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(member)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms)
            .ignore();

        let (count, oldest): (u64, Vec<(String, f64)>) =
            pipe.query_async(&mut conn).await.map_err(map_err)?;

        let allowed = count <= limit;
        if !allowed {
            // Evict our own member so the rejection does not shrink the
            // budget of later requests. Best effort outside the pipeline.
            let _: Result<i64, _> = conn.zrem(key, member).await;
        }

        Ok(WindowDecision {
            allowed,
            current_count: if allowed { count } else { count - 1 },
            oldest_score_ms: oldest.first().map(|(_, score)| *score as i64),
        })
    }
}
