//! Permission catalog and user grants consumed by the gateway's
//! permission checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::route::RecordStatus;

/// A named permission such as `user.read` or `route.manage`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Permission {
    pub id: String,
    pub permission_code: String,
    pub permission_name: String,
    pub description: Option<String>,
    pub resource_type: Option<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    pub is_system: bool,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

/// A grant binding a permission to a user, optionally time-limited.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserPermissionGrant {
    pub id: String,
    pub user_id: String,
    pub role: String,
    pub permission_id: String,
    pub granted_by: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: RecordStatus,
}

impl UserPermissionGrant {
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::Active
            && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

/// Admin request body for `POST /admin/permissions`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PermissionCreateRequest {
    pub permission_code: String,
    pub permission_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub is_system: bool,
}

impl PermissionCreateRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.permission_code.is_empty() || self.permission_code.len() > 100 {
            return Err("permission_code: length must be between 1 and 100".to_string());
        }
        if self.permission_name.is_empty() || self.permission_name.len() > 100 {
            return Err("permission_name: length must be between 1 and 100".to_string());
        }
        if let Some(desc) = &self.description {
            if desc.len() > 500 {
                return Err("description: length must be at most 500".to_string());
            }
        }
        Ok(())
    }
}

/// Admin request body for `POST /admin/permissions/grant`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PermissionGrantRequest {
    pub user_id: String,
    pub permission_codes: Vec<String>,
    pub role: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PermissionGrantRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.is_empty() || self.user_id.len() > 36 {
            return Err("user_id: length must be between 1 and 36".to_string());
        }
        if self.permission_codes.is_empty() {
            return Err("permission_codes: at least one code is required".to_string());
        }
        if self.role.is_empty() || self.role.len() > 50 {
            return Err("role: length must be between 1 and 50".to_string());
        }
        Ok(())
    }
}
