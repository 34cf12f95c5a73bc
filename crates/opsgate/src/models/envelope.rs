//! Uniform response envelope shared by every gateway-originated response.
//!
//! All JSON bodies produced by the gateway itself (errors, admin results,
//! health payloads) use the `{code, msg, content}` wrapper with stable
//! business codes, so existing platform clients can keep a single
//! deserialization path.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Stable business codes carried in the envelope `code` field.
///
/// `S10000` is the single success code; failure codes are grouped by the
/// HTTP class they usually ride on, but the mapping is owned by
/// [`crate::models::error::GatewayError`].
pub mod codes {
    pub const SUCCESS: &str = "S10000";

    pub const BAD_REQUEST: &str = "F40000";
    pub const UNAUTHORIZED: &str = "F40001";
    pub const FORBIDDEN: &str = "F40003";
    pub const NOT_FOUND: &str = "F40004";
    pub const METHOD_NOT_ALLOWED: &str = "F40005";

    /// Admin input validation failures ride on HTTP 200 for client
    /// compatibility; the envelope code is the only failure signal.
    pub const VALIDATION_ERROR: &str = "F10001";

    pub const TOKEN_EXPIRED: &str = "F40103";
    pub const TOKEN_INVALID: &str = "F40104";

    pub const ROUTE_NOT_FOUND: &str = "F40400";
    pub const RATE_LIMIT_EXCEEDED: &str = "F42900";
    pub const SERVICE_UNAVAILABLE: &str = "F50300";
    pub const CIRCUIT_BREAKER_OPEN: &str = "F50301";
    pub const GATEWAY_TIMEOUT: &str = "F50400";
    pub const UPSTREAM_ERROR: &str = "F50200";

    pub const INTERNAL_ERROR: &str = "F50000";
    pub const DATABASE_ERROR: &str = "F50001";
    pub const CACHE_ERROR: &str = "F50002";
}

/// The `{code, msg, content}` wrapper.
///
/// `content` is an object or array payload on success and `{}` on
/// failure; error bodies never carry stack traces or internal paths.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiResponse {
    pub code: String,
    pub msg: String,
    pub content: Value,
}

impl ApiResponse {
    pub fn success(content: Value) -> Self {
        Self {
            code: codes::SUCCESS.to_string(),
            msg: "success".to_string(),
            content,
        }
    }

    pub fn success_msg(msg: impl Into<String>, content: Value) -> Self {
        Self {
            code: codes::SUCCESS.to_string(),
            msg: msg.into(),
            content,
        }
    }

    pub fn fail(code: &str, msg: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            msg: msg.into(),
            content: json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_uses_stable_code() {
        let resp = ApiResponse::success(json!({"id": "r1"}));
        assert_eq!(resp.code, "S10000");
        assert_eq!(resp.content["id"], "r1");
    }

    #[test]
    fn fail_envelope_has_empty_content() {
        let resp = ApiResponse::fail(codes::ROUTE_NOT_FOUND, "ROUTE_NOT_FOUND");
        assert_eq!(resp.code, "F40400");
        assert!(resp.content.as_object().unwrap().is_empty());
    }
}
