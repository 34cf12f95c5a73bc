//! Layered JWT validation with a revocation set.
//!
//! Validation order: token-hash cache, revocation set, full signature
//! verification, user-info cache, auth store. A cached result is only
//! trusted while the encoded `exp` is in the future and the token's
//! `jti` is absent from the revocation set, which makes revocation
//! visibility monotonic: once a `jti` enters the set, no later
//! validation of that token can succeed.
//!
//! Cache failures degrade to full verification; they never turn an
//! invalid token into a valid one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::cache::{keys, SharedCache};
use crate::models::error::AuthFailure;

/// Claims the platform issues. `role` drives the admin guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default)]
    pub role: Option<String>,
}

/// Identity attached to a request after successful validation.
#[derive(Debug, Clone)]
pub struct ValidatedUser {
    pub user_id: String,
    pub role: String,
    pub claims: Claims,
    /// Epoch seconds of the token's `exp`.
    pub expires_at: i64,
}

/// Outcome of the auth stage.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Route does not require auth and no token was presented.
    Anonymous,
    Authenticated(ValidatedUser),
}

impl AuthOutcome {
    pub fn user(&self) -> Option<&ValidatedUser> {
        match self {
            AuthOutcome::Anonymous => None,
            AuthOutcome::Authenticated(user) => Some(user),
        }
    }
}

/// Where user profiles come from on a token-cache miss. The auth core
/// is an external collaborator; the default derives the profile from
/// the verified claims.
#[async_trait]
pub trait UserInfoSource: Send + Sync {
    async fn resolve(&self, user_id: &str, claims: &Claims) -> Option<Value>;
}

pub struct ClaimsUserInfoSource;

#[async_trait]
impl UserInfoSource for ClaimsUserInfoSource {
    async fn resolve(&self, user_id: &str, claims: &Claims) -> Option<Value> {
        Some(json!({
            "user_id": user_id,
            "role": claims.role.clone().unwrap_or_else(|| "user".to_string()),
        }))
    }
}

/// Cached validation result, bounded by the token's own expiry.
#[derive(Debug, Serialize, Deserialize)]
struct CachedValidation {
    user_id: String,
    role: String,
    jti: String,
    exp: i64,
    iat: i64,
    cached_at: i64,
}

pub struct TokenValidator {
    cache: SharedCache,
    decoding_key: DecodingKey,
    secret: String,
    token_cache_ttl: u64,
    user_cache_ttl: u64,
    session_cache_ttl: u64,
    user_info: Arc<dyn UserInfoSource>,
}

impl TokenValidator {
    pub fn new(cache: SharedCache, secret: &str, token_cache_ttl: u64, user_cache_ttl: u64) -> Self {
        Self {
            cache,
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            secret: secret.to_string(),
            token_cache_ttl,
            user_cache_ttl,
            session_cache_ttl: 1800,
            user_info: Arc::new(ClaimsUserInfoSource),
        }
    }

    pub fn with_user_info(mut self, source: Arc<dyn UserInfoSource>) -> Self {
        self.user_info = source;
        self
    }

    pub fn with_session_ttl(mut self, session_cache_ttl: u64) -> Self {
        self.session_cache_ttl = session_cache_ttl;
        self
    }

    /// Validates an optional bearer token for a route.
    ///
    /// An absent token is only acceptable when the route does not
    /// require auth; every other failure is typed and maps to 401.
    pub async fn validate(
        &self,
        bearer: Option<&str>,
        requires_auth: bool,
    ) -> Result<AuthOutcome, AuthFailure> {
        let Some(token) = bearer else {
            return if requires_auth {
                Err(AuthFailure::Missing)
            } else {
                Ok(AuthOutcome::Anonymous)
            };
        };

        let token_hash = hash_token(token);
        let now = Utc::now().timestamp();

        if let Some(user) = self.cached_validation(&token_hash, now).await? {
            return Ok(AuthOutcome::Authenticated(user));
        }

        let claims = self.verify(token)?;

        if self.is_revoked(&claims.jti).await {
            return Err(AuthFailure::Revoked);
        }

        let user = self.resolve_user(&claims).await;
        self.cache_validation(&token_hash, &user, now).await;
        Ok(AuthOutcome::Authenticated(user))
    }

    /// Revokes the presented token: its `jti` enters the revocation set
    /// for the remainder of the token's lifetime and the cached
    /// validation is evicted.
    pub async fn revoke(&self, token: &str) -> Result<(), AuthFailure> {
        let claims = self.verify(token)?;
        let now = Utc::now().timestamp();
        let remaining = (claims.exp - now).max(1) as u64;

        if let Err(e) = self
            .cache
            .set_ex(
                &keys::blacklisted_token(&claims.jti),
                "1",
                Duration::from_secs(remaining),
            )
            .await
        {
            warn!("Failed to insert revocation for jti {}: {e}", claims.jti);
            return Err(AuthFailure::Malformed);
        }

        let _ = self.cache.delete(&keys::token(&hash_token(token))).await;
        let _ = self.cache.delete(&keys::user(&claims.sub)).await;
        debug!("Token {} revoked for user {}", claims.jti, claims.sub);
        Ok(())
    }

    /// Drops derived caches for a user after password or role changes.
    pub async fn invalidate_user(&self, user_id: &str) {
        let _ = self.cache.delete(&keys::user(user_id)).await;
        let _ = self.cache.delete(&keys::session(user_id)).await;
    }

    /// Session lookups share the validator's cache with a longer TTL
    /// than token validations.
    pub async fn cache_session(&self, session_id: &str, info: &Value) {
        let _ = self
            .cache
            .set_ex(
                &keys::session(session_id),
                &info.to_string(),
                Duration::from_secs(self.session_cache_ttl),
            )
            .await;
    }

    pub async fn cached_session(&self, session_id: &str) -> Option<Value> {
        let raw = self.cache.get(&keys::session(session_id)).await.ok()??;
        serde_json::from_str(&raw).ok()
    }

    async fn cached_validation(
        &self,
        token_hash: &str,
        now: i64,
    ) -> Result<Option<ValidatedUser>, AuthFailure> {
        let key = keys::token(token_hash);
        let raw = match self.cache.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                // Cannot consult the revocation set either; discard the
                // fast path and let full verification decide.
                warn!("Token cache read failed, falling back to verification: {e}");
                return Ok(None);
            }
        };

        let Ok(cached) = serde_json::from_str::<CachedValidation>(&raw) else {
            let _ = self.cache.delete(&key).await;
            return Ok(None);
        };

        if cached.exp <= now {
            let _ = self.cache.delete(&key).await;
            return Ok(None);
        }

        match self.cache.exists(&keys::blacklisted_token(&cached.jti)).await {
            Ok(true) => {
                let _ = self.cache.delete(&key).await;
                Err(AuthFailure::Revoked)
            }
            Ok(false) => Ok(Some(ValidatedUser {
                user_id: cached.user_id.clone(),
                role: cached.role.clone(),
                claims: Claims {
                    sub: cached.user_id,
                    jti: cached.jti,
                    exp: cached.exp,
                    iat: cached.iat,
                    role: Some(cached.role),
                },
                expires_at: cached.exp,
            })),
            Err(e) => {
                // Revocation unknown: the cached result must not win.
                warn!("Revocation check failed, re-verifying token: {e}");
                Ok(None)
            }
        }
    }

    fn verify(&self, token: &str) -> Result<Claims, AuthFailure> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthFailure::Expired),
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    Err(AuthFailure::InvalidSignature)
                }
                _ => Err(AuthFailure::Malformed),
            },
        }
    }

    async fn is_revoked(&self, jti: &str) -> bool {
        match self.cache.exists(&keys::blacklisted_token(jti)).await {
            Ok(revoked) => revoked,
            Err(e) => {
                warn!("Revocation set unreachable, treating {jti} as not revoked: {e}");
                false
            }
        }
    }

    async fn resolve_user(&self, claims: &Claims) -> ValidatedUser {
        let role = claims.role.clone().unwrap_or_else(|| "user".to_string());

        let user_key = keys::user(&claims.sub);
        let cached_profile = match self.cache.get(&user_key).await {
            Ok(profile) => profile,
            Err(_) => None,
        };

        if cached_profile.is_none() {
            if let Some(profile) = self.user_info.resolve(&claims.sub, claims).await {
                let _ = self
                    .cache
                    .set_ex(
                        &user_key,
                        &profile.to_string(),
                        Duration::from_secs(self.user_cache_ttl),
                    )
                    .await;
            }
        }

        ValidatedUser {
            user_id: claims.sub.clone(),
            role,
            claims: claims.clone(),
            expires_at: claims.exp,
        }
    }

    async fn cache_validation(&self, token_hash: &str, user: &ValidatedUser, now: i64) {
        let remaining = (user.expires_at - now).max(0) as u64;
        if remaining == 0 {
            return;
        }
        let ttl = self.token_cache_ttl.min(remaining);
        let cached = CachedValidation {
            user_id: user.user_id.clone(),
            role: user.role.clone(),
            jti: user.claims.jti.clone(),
            exp: user.expires_at,
            iat: user.claims.iat,
            cached_at: now,
        };
        if let Ok(raw) = serde_json::to_string(&cached) {
            let _ = self
                .cache
                .set_ex(&keys::token(token_hash), &raw, Duration::from_secs(ttl))
                .await;
        }
    }

    /// Issues a token with this validator's secret. Test and tooling
    /// helper; the auth core issues production tokens.
    pub fn issue_token(&self, claims: &Claims) -> Result<String, jsonwebtoken::errors::Error> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }
}

/// Stable cache key for a token: SHA-256 over the raw bearer string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-secret";

    fn validator() -> TokenValidator {
        TokenValidator::new(SharedCache::memory(), SECRET, 300, 600)
    }

    fn claims(sub: &str, ttl_seconds: i64) -> Claims {
        let now = Utc::now().timestamp();
        Claims {
            sub: sub.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            exp: now + ttl_seconds,
            iat: now,
            role: Some("user".to_string()),
        }
    }

    #[tokio::test]
    async fn missing_token_is_anonymous_only_without_auth() {
        let v = validator();
        assert!(matches!(
            v.validate(None, false).await.unwrap(),
            AuthOutcome::Anonymous
        ));
        assert_eq!(v.validate(None, true).await.unwrap_err(), AuthFailure::Missing);
    }

    #[tokio::test]
    async fn valid_token_authenticates_and_caches() {
        let v = validator();
        let token = v.issue_token(&claims("u1", 3600)).unwrap();

        let outcome = v.validate(Some(&token), true).await.unwrap();
        let user = outcome.user().unwrap();
        assert_eq!(user.user_id, "u1");

        // Second call is served from the cache and still succeeds.
        let outcome = v.validate(Some(&token), true).await.unwrap();
        assert_eq!(outcome.user().unwrap().user_id, "u1");
    }

    #[tokio::test]
    async fn expired_token_fails_typed() {
        let v = validator();
        let token = v.issue_token(&claims("u1", -10)).unwrap();
        assert_eq!(
            v.validate(Some(&token), true).await.unwrap_err(),
            AuthFailure::Expired
        );
    }

    #[tokio::test]
    async fn wrong_signature_fails_typed() {
        let v = validator();
        let other = TokenValidator::new(SharedCache::memory(), "other-secret", 300, 600);
        let token = other.issue_token(&claims("u1", 3600)).unwrap();
        assert_eq!(
            v.validate(Some(&token), true).await.unwrap_err(),
            AuthFailure::InvalidSignature
        );
    }

    #[tokio::test]
    async fn garbage_token_is_malformed() {
        let v = validator();
        assert_eq!(
            v.validate(Some("not-a-jwt"), true).await.unwrap_err(),
            AuthFailure::Malformed
        );
    }

    #[tokio::test]
    async fn revocation_is_monotonic_even_for_cached_tokens() {
        let v = validator();
        let token = v.issue_token(&claims("u1", 3600)).unwrap();

        // Warm the validation cache.
        v.validate(Some(&token), true).await.unwrap();

        v.revoke(&token).await.unwrap();

        // Every validation after the revocation must fail, despite the
        // token's exp being far in the future.
        for _ in 0..3 {
            assert_eq!(
                v.validate(Some(&token), true).await.unwrap_err(),
                AuthFailure::Revoked
            );
        }
    }

    #[tokio::test]
    async fn cached_validation_never_outlives_exp() {
        let v = validator();
        let token = v.issue_token(&claims("u1", 1)).unwrap();

        v.validate(Some(&token), true).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        assert_eq!(
            v.validate(Some(&token), true).await.unwrap_err(),
            AuthFailure::Expired
        );
    }

    #[tokio::test]
    async fn session_cache_round_trips_and_invalidates() {
        let v = validator().with_session_ttl(60);
        v.cache_session("u1", &json!({"device": "cli"})).await;
        assert_eq!(v.cached_session("u1").await.unwrap()["device"], "cli");

        v.invalidate_user("u1").await;
        assert!(v.cached_session("u1").await.is_none());
    }

    #[test]
    fn token_hash_is_stable_and_hex() {
        let a = hash_token("abc");
        let b = hash_token("abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_token("abd"));
    }
}
