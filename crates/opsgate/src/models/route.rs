//! Route definitions and the admin-facing request records.
//!
//! A route binds a `(path_pattern, method)` pair to a named upstream
//! service together with its policy bundle: authentication, required
//! permissions, rate limit, timeout/retry budget, circuit breaker,
//! response cache and load-balancing strategy. Admin JSON bodies are
//! parsed into the explicit request records below and validated with the
//! same ranges the platform has always enforced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTTP method a route answers to. `Any` matches every method.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "PATCH")]
    Patch,
    #[serde(rename = "ANY")]
    Any,
}

impl RouteMethod {
    /// Whether an incoming request method is admitted by this route.
    pub fn admits(&self, method: &str) -> bool {
        match self {
            RouteMethod::Any => true,
            RouteMethod::Get => method == "GET",
            RouteMethod::Post => method == "POST",
            RouteMethod::Put => method == "PUT",
            RouteMethod::Delete => method == "DELETE",
            RouteMethod::Patch => method == "PATCH",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMethod::Get => "GET",
            RouteMethod::Post => "POST",
            RouteMethod::Put => "PUT",
            RouteMethod::Delete => "DELETE",
            RouteMethod::Patch => "PATCH",
            RouteMethod::Any => "ANY",
        }
    }
}

/// How `required_permissions` combine: one hit suffices, or all must hold.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStrategy {
    #[default]
    Any,
    All,
}

/// Upstream selection strategy for a route's service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
}

/// Record lifecycle status. Soft deletion is a status transition, never a
/// physical delete.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "deleted")]
    Deleted,
}

/// A persisted route definition.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Route {
    pub id: String,
    pub service_name: String,
    pub path_pattern: String,
    pub method: RouteMethod,
    pub version: String,
    pub is_active: bool,
    pub requires_auth: bool,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub permission_check_strategy: PermissionStrategy,
    pub rate_limit_rpm: u32,
    pub timeout_seconds: u64,
    pub retry_count: u32,
    pub circuit_breaker_enabled: bool,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub load_balance_strategy: LoadBalanceStrategy,
    pub priority: u8,
    /// Monotonic insertion sequence, used to break priority ties.
    pub seq: u64,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Route {
    /// A route participates in matching only while active and not deleted.
    pub fn is_matchable(&self) -> bool {
        self.is_active && self.status == RecordStatus::Active
    }
}

fn default_version() -> String {
    "v1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_rpm() -> u32 {
    1000
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    3
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

/// Admin request body for `POST /admin/routes`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RouteCreateRequest {
    pub service_name: String,
    pub path_pattern: String,
    pub method: RouteMethod,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_true")]
    pub requires_auth: bool,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default)]
    pub permission_check_strategy: PermissionStrategy,
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_true")]
    pub circuit_breaker_enabled: bool,
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub load_balance_strategy: LoadBalanceStrategy,
    #[serde(default)]
    pub priority: u8,
}

impl RouteCreateRequest {
    /// Validates field ranges; the first violation is returned as the
    /// field-level message carried in the validation envelope.
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.is_empty() || self.service_name.len() > 100 {
            return Err("service_name: length must be between 1 and 100".to_string());
        }
        if self.path_pattern.is_empty() || self.path_pattern.len() > 500 {
            return Err("path_pattern: length must be between 1 and 500".to_string());
        }
        if !self.path_pattern.starts_with('/') {
            return Err("path_pattern: must start with '/'".to_string());
        }
        if self.version.len() > 20 {
            return Err("version: length must be at most 20".to_string());
        }
        if self.rate_limit_rpm == 0 || self.rate_limit_rpm > 100_000 {
            return Err("rate_limit_rpm: must be between 1 and 100000".to_string());
        }
        if self.timeout_seconds == 0 || self.timeout_seconds > 300 {
            return Err("timeout_seconds: must be between 1 and 300".to_string());
        }
        if self.retry_count > 10 {
            return Err("retry_count: must be between 0 and 10".to_string());
        }
        if self.cache_ttl_seconds == 0 || self.cache_ttl_seconds > 3600 {
            return Err("cache_ttl_seconds: must be between 1 and 3600".to_string());
        }
        if self.priority > 100 {
            return Err("priority: must be between 0 and 100".to_string());
        }
        Ok(())
    }
}

/// Admin request body for `PUT /admin/routes/{id}`. Only supplied fields
/// are applied.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RouteUpdateRequest {
    pub service_name: Option<String>,
    pub path_pattern: Option<String>,
    pub method: Option<RouteMethod>,
    pub version: Option<String>,
    pub is_active: Option<bool>,
    pub requires_auth: Option<bool>,
    pub required_permissions: Option<Vec<String>>,
    pub permission_check_strategy: Option<PermissionStrategy>,
    pub rate_limit_rpm: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub retry_count: Option<u32>,
    pub circuit_breaker_enabled: Option<bool>,
    pub cache_enabled: Option<bool>,
    pub cache_ttl_seconds: Option<u64>,
    pub load_balance_strategy: Option<LoadBalanceStrategy>,
    pub priority: Option<u8>,
}

impl RouteUpdateRequest {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.service_name {
            if name.is_empty() || name.len() > 100 {
                return Err("service_name: length must be between 1 and 100".to_string());
            }
        }
        if let Some(pattern) = &self.path_pattern {
            if pattern.is_empty() || pattern.len() > 500 {
                return Err("path_pattern: length must be between 1 and 500".to_string());
            }
            if !pattern.starts_with('/') {
                return Err("path_pattern: must start with '/'".to_string());
            }
        }
        if let Some(version) = &self.version {
            if version.len() > 20 {
                return Err("version: length must be at most 20".to_string());
            }
        }
        if let Some(rpm) = self.rate_limit_rpm {
            if rpm == 0 || rpm > 100_000 {
                return Err("rate_limit_rpm: must be between 1 and 100000".to_string());
            }
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 || timeout > 300 {
                return Err("timeout_seconds: must be between 1 and 300".to_string());
            }
        }
        if let Some(retries) = self.retry_count {
            if retries > 10 {
                return Err("retry_count: must be between 0 and 10".to_string());
            }
        }
        if let Some(ttl) = self.cache_ttl_seconds {
            if ttl == 0 || ttl > 3600 {
                return Err("cache_ttl_seconds: must be between 1 and 3600".to_string());
            }
        }
        if let Some(priority) = self.priority {
            if priority > 100 {
                return Err("priority: must be between 0 and 100".to_string());
            }
        }
        Ok(())
    }
}

/// Batch variant of route creation, capped at 50 entries per request.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BatchRouteCreateRequest {
    pub routes: Vec<RouteCreateRequest>,
}

impl BatchRouteCreateRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.routes.is_empty() || self.routes.len() > 50 {
            return Err("routes: length must be between 1 and 50".to_string());
        }
        for route in &self.routes {
            route.validate()?;
        }
        Ok(())
    }
}
