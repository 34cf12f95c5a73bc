//! Permission checks against the platform's permission core.
//!
//! The gateway consults the store's permission tables with the matched
//! route's `(codes, strategy)` pair. `any` passes on the first hit,
//! `all` requires every code. An empty requirement always passes.

use std::sync::Arc;

use serde_json::json;

use crate::models::error::GatewayError;
use crate::models::route::PermissionStrategy;
use crate::store::RouteStore;

/// Result detail recorded into the call log.
#[derive(Debug, Clone)]
pub struct PermissionCheck {
    pub granted: bool,
    pub detail: serde_json::Value,
}

pub struct PermissionChecker {
    store: Arc<RouteStore>,
}

impl PermissionChecker {
    pub fn new(store: Arc<RouteStore>) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        user_id: &str,
        required: &[String],
        strategy: PermissionStrategy,
    ) -> PermissionCheck {
        if required.is_empty() {
            return PermissionCheck {
                granted: true,
                detail: json!({"required": [], "strategy": strategy_str(strategy)}),
            };
        }

        let held = self.store.user_permission_codes(user_id).await;
        let granted = match strategy {
            PermissionStrategy::Any => required.iter().any(|code| held.contains(code)),
            PermissionStrategy::All => required.iter().all(|code| held.contains(code)),
        };

        PermissionCheck {
            granted,
            detail: json!({
                "required": required,
                "strategy": strategy_str(strategy),
                "granted": granted,
            }),
        }
    }

    /// Pipeline wrapper: denial maps straight to the 403 envelope.
    pub async fn require(
        &self,
        user_id: &str,
        required: &[String],
        strategy: PermissionStrategy,
    ) -> Result<PermissionCheck, GatewayError> {
        let check = self.check(user_id, required, strategy).await;
        if check.granted {
            Ok(check)
        } else {
            Err(GatewayError::Forbidden {
                user_id: user_id.to_string(),
            })
        }
    }
}

fn strategy_str(strategy: PermissionStrategy) -> &'static str {
    match strategy {
        PermissionStrategy::Any => "any",
        PermissionStrategy::All => "all",
    }
}
