//! Per-request call telemetry record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record per completed request, written asynchronously after the
/// response has been delivered.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CallLog {
    pub id: String,
    pub request_id: String,
    pub user_id: Option<String>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query_params: Option<Value>,
    /// Whitelisted request headers only; credentials are never logged.
    #[serde(default)]
    pub headers: Option<Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub target_service: Option<String>,
    pub response_status: Option<u16>,
    /// Bytes of the body actually delivered to the client.
    pub response_size: Option<u64>,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub permission_check_result: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl CallLog {
    pub fn new(request_id: String, method: String, path: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request_id,
            user_id: None,
            method,
            path,
            query_params: None,
            headers: None,
            ip_address: None,
            user_agent: None,
            target_service: None,
            response_status: None,
            response_size: None,
            response_time_ms: None,
            error_message: None,
            permission_check_result: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}
