//! Per-route response caching for idempotent requests.
//!
//! Routes opt in via `cache_enabled`; only GET responses with 2xx
//! status under the configured size cap are stored, for the route's TTL.
//! The key covers everything that can change the payload: route, path,
//! canonicalized query, the content-negotiation headers, and the user
//! scope when the route requires auth (a user-scoped response must never
//! leak across users).

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::{keys, SharedCache};
use crate::utils::path::sorted_query;

/// Response headers worth replaying from the cache.
const REPLAYED_HEADERS: &[&str] = &["content-type", "cache-control", "etag", "last-modified"];

#[derive(Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body_b64: String,
}

/// A cache hit ready to be turned into a client response.
#[derive(Debug, Clone)]
pub struct CachedHttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct ResponseCache {
    cache: SharedCache,
    max_body_bytes: usize,
}

impl ResponseCache {
    pub fn new(cache: SharedCache, max_body_bytes: usize) -> Self {
        Self {
            cache,
            max_body_bytes,
        }
    }

    /// Deterministic key over the response-shaping request dimensions.
    pub fn cache_key(
        route_id: &str,
        path: &str,
        query: &str,
        accept: Option<&str>,
        accept_encoding: Option<&str>,
        user_scope: Option<&str>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(route_id.as_bytes());
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
        hasher.update(b"\n");
        hasher.update(sorted_query(query).as_bytes());
        hasher.update(b"\n");
        hasher.update(accept.unwrap_or("").as_bytes());
        hasher.update(b"\n");
        hasher.update(accept_encoding.unwrap_or("").as_bytes());
        hasher.update(b"\n");
        hasher.update(user_scope.unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Cache errors read as misses; the proxy just goes upstream.
    pub async fn lookup(&self, key: &str) -> Option<CachedHttpResponse> {
        let raw = self.cache.get(&keys::response(key)).await.ok()??;
        let stored: StoredResponse = serde_json::from_str(&raw).ok()?;
        let body = BASE64.decode(&stored.body_b64).ok()?;
        Some(CachedHttpResponse {
            status: stored.status,
            headers: stored.headers,
            body,
        })
    }

    /// Stores a 2xx response under the size cap; anything else is a no-op.
    pub async fn store(
        &self,
        key: &str,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
        ttl_seconds: u64,
    ) {
        if !(200..300).contains(&status) || body.len() > self.max_body_bytes {
            return;
        }
        let stored = StoredResponse {
            status,
            headers: headers
                .iter()
                .filter(|(name, _)| REPLAYED_HEADERS.contains(&name.to_lowercase().as_str()))
                .cloned()
                .collect(),
            body_b64: BASE64.encode(body),
        };
        let Ok(raw) = serde_json::to_string(&stored) else {
            return;
        };
        if let Err(e) = self
            .cache
            .set_ex(&keys::response(key), &raw, Duration::from_secs(ttl_seconds))
            .await
        {
            debug!("Response cache store skipped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache {
        ResponseCache::new(SharedCache::memory(), 1024)
    }

    #[tokio::test]
    async fn round_trips_status_headers_and_body() {
        let rc = cache();
        let key = ResponseCache::cache_key("r1", "/api/v1/users", "page=1", None, None, None);
        rc.store(
            &key,
            200,
            &[
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Internal".to_string(), "secret".to_string()),
            ],
            br#"{"ok":true}"#,
            60,
        )
        .await;

        let hit = rc.lookup(&key).await.unwrap();
        assert_eq!(hit.status, 200);
        assert_eq!(hit.body, br#"{"ok":true}"#);
        // Only whitelisted headers are replayed.
        assert!(hit.headers.iter().any(|(n, _)| n == "Content-Type"));
        assert!(!hit.headers.iter().any(|(n, _)| n == "X-Internal"));
    }

    #[tokio::test]
    async fn non_2xx_and_oversized_bodies_are_not_stored() {
        let rc = cache();
        let key = ResponseCache::cache_key("r1", "/a", "", None, None, None);

        rc.store(&key, 404, &[], b"nope", 60).await;
        assert!(rc.lookup(&key).await.is_none());

        let huge = vec![b'x'; 2048];
        rc.store(&key, 200, &[], &huge, 60).await;
        assert!(rc.lookup(&key).await.is_none());
    }

    #[test]
    fn key_ignores_query_order_but_not_user_scope() {
        let a = ResponseCache::cache_key("r1", "/a", "x=1&y=2", None, None, Some("u1"));
        let b = ResponseCache::cache_key("r1", "/a", "y=2&x=1", None, None, Some("u1"));
        let c = ResponseCache::cache_key("r1", "/a", "x=1&y=2", None, None, Some("u2"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
