//! Service instance records for the registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::route::RecordStatus;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Health state of a registered instance.
///
/// Only `Healthy` instances are eligible for load balancing; `Draining`
/// instances accept no new traffic but may finish in-flight requests.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Healthy,
    Unhealthy,
    Draining,
}

/// A concrete network address serving a named service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceInstance {
    pub id: String,
    pub service_name: String,
    /// Operator-chosen identifier, unique within the service.
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    pub weight: u32,
    #[serde(default)]
    pub instance_status: InstanceStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_url: Option<String>,
    pub health_check_interval_seconds: u64,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub registered_at: DateTime<Utc>,
    pub status: RecordStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    pub fn is_registered(&self) -> bool {
        self.status == RecordStatus::Active
    }

    /// Eligible to receive new traffic.
    pub fn is_healthy(&self) -> bool {
        self.is_registered() && self.instance_status == InstanceStatus::Healthy
    }

    /// Base URL for forwarding, e.g. `http://10.0.0.3:8080`.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

fn default_weight() -> u32 {
    100
}

fn default_health_interval() -> u64 {
    30
}

/// Admin request body for `POST /admin/services`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InstanceRegisterRequest {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl InstanceRegisterRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.is_empty() || self.service_name.len() > 100 {
            return Err("service_name: length must be between 1 and 100".to_string());
        }
        if self.instance_id.is_empty() || self.instance_id.len() > 100 {
            return Err("instance_id: length must be between 1 and 100".to_string());
        }
        if self.host.is_empty() || self.host.len() > 255 {
            return Err("host: length must be between 1 and 255".to_string());
        }
        if self.port == 0 {
            return Err("port: must be between 1 and 65535".to_string());
        }
        if self.weight == 0 || self.weight > 1000 {
            return Err("weight: must be between 1 and 1000".to_string());
        }
        if let Some(url) = &self.health_check_url {
            if url.len() > 500 {
                return Err("health_check_url: length must be at most 500".to_string());
            }
        }
        if self.health_check_interval_seconds < 5 || self.health_check_interval_seconds > 300 {
            return Err("health_check_interval_seconds: must be between 5 and 300".to_string());
        }
        Ok(())
    }
}

/// Batch variant of instance registration, capped at 20 entries.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BatchInstanceRegisterRequest {
    pub instances: Vec<InstanceRegisterRequest>,
}

impl BatchInstanceRegisterRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.instances.is_empty() || self.instances.len() > 20 {
            return Err("instances: length must be between 1 and 20".to_string());
        }
        for instance in &self.instances {
            instance.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_request_validates_ranges() {
        let req: InstanceRegisterRequest = serde_json::from_value(json!({
            "service_name": "orders",
            "instance_id": "orders-1",
            "host": "10.0.0.3",
            "port": 8080
        }))
        .unwrap();
        assert_eq!(req.weight, 100);
        assert_eq!(req.health_check_interval_seconds, 30);
        assert!(req.validate().is_ok());

        let mut bad = req.clone();
        bad.weight = 0;
        assert!(bad.validate().is_err());

        let mut bad = req;
        bad.health_check_interval_seconds = 3;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn base_url_includes_protocol_and_port() {
        let req: InstanceRegisterRequest = serde_json::from_value(json!({
            "service_name": "orders",
            "instance_id": "orders-1",
            "host": "10.0.0.3",
            "port": 8443,
            "protocol": "https"
        }))
        .unwrap();
        let instance = ServiceInstance {
            id: "i1".into(),
            service_name: req.service_name,
            instance_id: req.instance_id,
            host: req.host,
            port: req.port,
            protocol: req.protocol,
            weight: req.weight,
            instance_status: InstanceStatus::Healthy,
            last_health_check: None,
            health_check_url: None,
            health_check_interval_seconds: 30,
            metadata: None,
            registered_at: Utc::now(),
            status: RecordStatus::Active,
            updated_at: None,
        };
        assert_eq!(instance.base_url(), "https://10.0.0.3:8443");
    }
}
