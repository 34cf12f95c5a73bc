//! Persisted circuit breaker state, one record per upstream service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three positions of a breaker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    #[default]
    Closed,
    /// Failing fast until `next_attempt_time`.
    Open,
    /// One probe in flight deciding the next state.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Breaker row mirrored into the store on every transition so operators
/// can inspect cluster state.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CircuitBreakerRecord {
    pub id: String,
    pub service_name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
    pub updated_at: DateTime<Utc>,
}

impl CircuitBreakerRecord {
    pub fn new(service_name: &str, failure_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service_name: service_name.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            failure_threshold,
            timeout_seconds,
            updated_at: Utc::now(),
        }
    }
}
