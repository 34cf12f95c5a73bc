//! In-process cache backend.
//!
//! Implements the same observable semantics as the Redis backend under a
//! single mutex: string values with TTL and sorted sets with millisecond
//! scores. TTLs are enforced lazily on access.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheBackend, CacheError, WindowDecision};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

struct SortedSet {
    /// (score_ms, member) ordered by score then member.
    members: BTreeMap<(i64, String), ()>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    strings: HashMap<String, Entry>,
    zsets: HashMap<String, SortedSet>,
}

/// Mutex-guarded in-memory store. `rate_limit_window` runs entirely
/// under the lock, which gives the same atomicity as a Redis pipeline.
pub struct MemoryCache {
    state: Mutex<State>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock means a panic mid-operation; recover the data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn expired(expires_at: Option<Instant>) -> bool {
    expires_at.map(|t| Instant::now() >= t).unwrap_or(false)
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut state = self.lock();
        if let Some(entry) = state.strings.get(key) {
            if !expired(entry.expires_at) {
                return Ok(Some(entry.value.clone()));
            }
            state.strings.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut state = self.lock();
        state.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut state = self.lock();
        let existed = state.strings.remove(key).is_some() | state.zsets.remove(key).is_some();
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut state = self.lock();
        if let Some(entry) = state.strings.get(key) {
            if !expired(entry.expires_at) {
                return Ok(true);
            }
            state.strings.remove(key);
        }
        if let Some(set) = state.zsets.get(key) {
            if !expired(set.expires_at) && !set.members.is_empty() {
                return Ok(true);
            }
            state.zsets.remove(key);
        }
        Ok(false)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut state = self.lock();
        let deadline = Some(Instant::now() + ttl);
        if let Some(entry) = state.strings.get_mut(key) {
            entry.expires_at = deadline;
        }
        if let Some(set) = state.zsets.get_mut(key) {
            set.expires_at = deadline;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
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
        let mut state = self.lock();
        let set = state.zsets.entry(key.to_string()).or_insert_with(|| SortedSet {
            members: BTreeMap::new(),
            expires_at: None,
        });

        if expired(set.expires_at) {
            set.members.clear();
        }

        let window_start = now_ms - window_ms;
        set.members = set.members.split_off(&(window_start, String::new()));

        set.members.insert((now_ms, member.to_string()), ());
        let count = set.members.len() as u64;
        let allowed = count <= limit;
        if !allowed {
            set.members.remove(&(now_ms, member.to_string()));
        }
        let oldest_score_ms = set.members.keys().next().map(|(score, _)| *score);
        set.expires_at = Some(Instant::now() + Duration::from_millis(window_ms as u64));

        Ok(WindowDecision {
            allowed,
            current_count: if allowed { count } else { count - 1 },
            oldest_score_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_respects_ttl() {
        let cache = MemoryCache::new();
        cache
            .set_ex("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn window_admits_up_to_limit() {
        let cache = MemoryCache::new();
        let now = 1_000_000;
        for i in 0..3 {
            let decision = cache
                .rate_limit_window("rl", &format!("m{i}"), now + i, 60_000, 3)
                .await
                .unwrap();
            assert!(decision.allowed, "request {i} should pass");
        }
        let decision = cache
            .rate_limit_window("rl", "m3", now + 10, 60_000, 3)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.oldest_score_ms, Some(now));
    }

    #[tokio::test]
    async fn window_slides_as_members_age_out() {
        let cache = MemoryCache::new();
        let decision = cache
            .rate_limit_window("rl", "old", 1_000, 1_000, 1)
            .await
            .unwrap();
        assert!(decision.allowed);

        // The old member falls outside the window at t=2500.
        let decision = cache
            .rate_limit_window("rl", "new", 2_500, 1_000, 1)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn rejected_member_does_not_consume_budget() {
        let cache = MemoryCache::new();
        let now = 5_000_000;
        assert!(cache
            .rate_limit_window("rl", "a", now, 60_000, 1)
            .await
            .unwrap()
            .allowed);
        assert!(!cache
            .rate_limit_window("rl", "b", now + 1, 60_000, 1)
            .await
            .unwrap()
            .allowed);
        // The rejection above must not have grown the window.
        let decision = cache
            .rate_limit_window("rl", "c", now + 2, 60_000, 2)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current_count, 2);
    }
}
