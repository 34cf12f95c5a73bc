//! Environment-driven gateway configuration.
//!
//! Every threshold the pipeline consults is read once at startup, with
//! the defaults the platform has always shipped. Unparseable values fall
//! back to the default rather than aborting startup; validation catches
//! the combinations that must not reach production.

use std::env;
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Complete runtime configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind address for the HTTP server.
    pub host: String,
    pub port: u16,

    /// HMAC secret for JWT signature validation.
    pub jwt_secret_key: String,

    /// Consecutive upstream failures before a service circuit opens.
    pub circuit_breaker_threshold: u32,
    /// Seconds an open circuit waits before admitting a probe.
    pub circuit_breaker_timeout: u64,

    /// Per-route default when a route does not carry its own limit.
    pub default_rate_limit_rpm: u32,
    /// Sliding-window length in seconds.
    pub default_rate_limit_window: u64,

    pub health_check_interval: u64,
    pub health_check_timeout: u64,
    /// Consecutive probe failures before an instance is marked unhealthy.
    pub unhealthy_threshold: u32,

    /// Default upstream timeout when a route does not carry its own.
    pub gateway_request_timeout: u64,
    pub gateway_max_retry_count: u32,

    pub response_cache_default_ttl: u64,
    /// Responses larger than this are never cached.
    pub response_cache_max_body_bytes: usize,

    /// Comma-separated allowed origins; `*` allows any.
    pub cors_origins: Vec<String>,

    pub token_cache_ttl: u64,
    pub user_cache_ttl: u64,
    pub session_cache_ttl: u64,

    /// Failed logins tolerated before the auth core locks an account.
    /// Consumed by the auth collaborator; surfaced here so operators set
    /// every threshold in one place.
    pub max_login_attempts: u32,

    /// Redis connection string; absent means the in-process cache.
    pub redis_url: Option<String>,

    /// Where the store persists its JSON snapshot.
    pub state_path: String,
    /// Where the call logger appends JSON lines.
    pub call_log_path: String,

    /// Safety-net rebuild interval for the route index.
    pub route_index_refresh_seconds: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let cors_origins = env_string("CORS_ORIGINS", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            host: env_string("OPSGATE_HOST", "0.0.0.0"),
            port: env_u32("OPSGATE_PORT", 8080) as u16,
            jwt_secret_key: env_string("JWT_SECRET_KEY", "APIGateway2025!"),
            circuit_breaker_threshold: env_u32("CIRCUIT_BREAKER_THRESHOLD", 5),
            circuit_breaker_timeout: env_u64("CIRCUIT_BREAKER_TIMEOUT", 60),
            default_rate_limit_rpm: env_u32("DEFAULT_RATE_LIMIT_RPM", 1000),
            default_rate_limit_window: env_u64("DEFAULT_RATE_LIMIT_WINDOW", 60),
            health_check_interval: env_u64("HEALTH_CHECK_INTERVAL", 30),
            health_check_timeout: env_u64("HEALTH_CHECK_TIMEOUT", 5),
            unhealthy_threshold: env_u32("UNHEALTHY_THRESHOLD", 3),
            gateway_request_timeout: env_u64("GATEWAY_REQUEST_TIMEOUT", 30),
            gateway_max_retry_count: env_u32("GATEWAY_MAX_RETRY_COUNT", 3),
            response_cache_default_ttl: env_u64("RESPONSE_CACHE_DEFAULT_TTL", 300),
            response_cache_max_body_bytes: env_u64("RESPONSE_CACHE_MAX_BODY_BYTES", 1024 * 1024)
                as usize,
            cors_origins,
            token_cache_ttl: env_u64("TOKEN_CACHE_TTL", 300),
            user_cache_ttl: env_u64("USER_CACHE_TTL", 600),
            session_cache_ttl: env_u64("SESSION_CACHE_TTL", 1800),
            max_login_attempts: env_u32("MAX_LOGIN_ATTEMPTS", 5),
            redis_url: env::var("REDIS_URL").ok(),
            state_path: env_string("OPSGATE_STATE_PATH", "./gateway_state.json"),
            call_log_path: env_string("OPSGATE_CALL_LOG_PATH", "./api_call_logs.jsonl"),
            route_index_refresh_seconds: env_u64("ROUTE_INDEX_REFRESH_SECONDS", 30),
        }
    }

    /// Startup validation. The server refuses to boot on any error here.
    pub fn validate(&self) -> Result<(), String> {
        if self.jwt_secret_key.is_empty() {
            return Err("JWT_SECRET_KEY cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("OPSGATE_PORT must be between 1 and 65535".to_string());
        }
        if self.circuit_breaker_threshold == 0 {
            return Err("CIRCUIT_BREAKER_THRESHOLD must be at least 1".to_string());
        }
        if self.default_rate_limit_window == 0 {
            return Err("DEFAULT_RATE_LIMIT_WINDOW must be at least 1 second".to_string());
        }
        if self.health_check_timeout >= self.health_check_interval {
            return Err(
                "HEALTH_CHECK_TIMEOUT must be smaller than HEALTH_CHECK_INTERVAL".to_string(),
            );
        }
        if self.gateway_request_timeout == 0 || self.gateway_request_timeout > 300 {
            return Err("GATEWAY_REQUEST_TIMEOUT must be between 1 and 300".to_string());
        }
        if self.cors_origins.is_empty() {
            return Err("CORS_ORIGINS must list at least one origin or '*'".to_string());
        }
        Ok(())
    }

    pub fn health_check_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout)
    }

    /// Whether an `Origin` header value is allowed by configuration.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.cors_origins.iter().any(|o| o == "*" || o == origin)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            jwt_secret_key: "APIGateway2025!".to_string(),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: 60,
            default_rate_limit_rpm: 1000,
            default_rate_limit_window: 60,
            health_check_interval: 30,
            health_check_timeout: 5,
            unhealthy_threshold: 3,
            gateway_request_timeout: 30,
            gateway_max_retry_count: 3,
            response_cache_default_ttl: 300,
            response_cache_max_body_bytes: 1024 * 1024,
            cors_origins: vec!["*".to_string()],
            token_cache_ttl: 300,
            user_cache_ttl: 600,
            session_cache_ttl: 1800,
            max_login_attempts: 5,
            redis_url: None,
            state_path: "./gateway_state.json".to_string(),
            call_log_path: "./api_call_logs.jsonl".to_string(),
            route_index_refresh_seconds: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_constants() {
        let config = GatewayConfig::default();
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.circuit_breaker_timeout, 60);
        assert_eq!(config.default_rate_limit_rpm, 1000);
        assert_eq!(config.default_rate_limit_window, 60);
        assert_eq!(config.health_check_interval, 30);
        assert_eq!(config.unhealthy_threshold, 3);
        assert_eq!(config.gateway_request_timeout, 30);
        assert_eq!(config.response_cache_default_ttl, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_inverted_health_timings() {
        let config = GatewayConfig {
            health_check_interval: 5,
            health_check_timeout: 5,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn wildcard_origin_allows_everything() {
        let config = GatewayConfig::default();
        assert!(config.origin_allowed("http://localhost:3000"));

        let pinned = GatewayConfig {
            cors_origins: vec!["http://localhost:3000".to_string()],
            ..GatewayConfig::default()
        };
        assert!(pinned.origin_allowed("http://localhost:3000"));
        assert!(!pinned.origin_allowed("http://evil.example"));
    }
}
