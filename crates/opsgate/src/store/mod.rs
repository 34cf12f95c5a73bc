//! Route store: the single owner of routes, service instances, circuit
//! breaker rows, permissions, and user grants.
//!
//! Tables live in memory behind an async `RwLock` and are written
//! through to a JSON snapshot on disk after every mutation, so a restart
//! resumes with the same configuration. Route mutations additionally bump
//! a `watch` revision the matcher subscribes to.
//!
//! Soft deletion everywhere: records transition to `Deleted` status and
//! stop participating in matching and balancing, but stay in the
//! snapshot.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::models::circuit::CircuitBreakerRecord;
use crate::models::error::GatewayError;
use crate::models::instance::{
    InstanceRegisterRequest, InstanceStatus, ServiceInstance,
};
use crate::models::permission::{
    Permission, PermissionCreateRequest, PermissionGrantRequest, UserPermissionGrant,
};
use crate::models::route::{
    RecordStatus, Route, RouteCreateRequest, RouteUpdateRequest,
};

/// On-disk snapshot layout.
#[derive(Serialize, Deserialize, Debug, Default)]
struct GatewayState {
    #[serde(default)]
    routes: Vec<Route>,
    #[serde(default)]
    instances: Vec<ServiceInstance>,
    #[serde(default)]
    circuits: Vec<CircuitBreakerRecord>,
    #[serde(default)]
    permissions: Vec<Permission>,
    #[serde(default)]
    grants: Vec<UserPermissionGrant>,
    #[serde(default)]
    next_seq: u64,
}

#[derive(Default)]
struct Tables {
    routes: Vec<Route>,
    instances: Vec<ServiceInstance>,
    circuits: HashMap<String, CircuitBreakerRecord>,
    permissions: Vec<Permission>,
    grants: Vec<UserPermissionGrant>,
    next_seq: u64,
}

pub struct RouteStore {
    tables: RwLock<Tables>,
    state_path: Option<PathBuf>,
    revision_tx: watch::Sender<u64>,
}

impl RouteStore {
    /// Store without persistence, used by tests.
    pub fn in_memory() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::default()),
            state_path: None,
            revision_tx,
        }
    }

    /// Opens a store backed by `state_path`, loading an existing
    /// snapshot when one is present.
    pub async fn open(state_path: impl Into<PathBuf>) -> Result<Self, GatewayError> {
        let state_path = state_path.into();
        let mut tables = Tables::default();

        match tokio::fs::read_to_string(&state_path).await {
            Ok(raw) => {
                let state: GatewayState = serde_json::from_str(&raw)
                    .map_err(|e| GatewayError::Store(format!("corrupt state file: {e}")))?;
                tables.next_seq = state.next_seq;
                tables.routes = state.routes;
                tables.instances = state.instances;
                tables.circuits = state
                    .circuits
                    .into_iter()
                    .map(|c| (c.service_name.clone(), c))
                    .collect();
                tables.permissions = state.permissions;
                tables.grants = state.grants;
                info!(
                    "Loaded gateway state: {} routes, {} instances",
                    tables.routes.len(),
                    tables.instances.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No gateway state at {}, starting empty", state_path.display());
            }
            Err(e) => return Err(GatewayError::Store(e.to_string())),
        }

        let (revision_tx, _) = watch::channel(0);
        Ok(Self {
            tables: RwLock::new(tables),
            state_path: Some(state_path),
            revision_tx,
        })
    }

    /// Receiver that observes the route revision counter.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    /// Spawns the route-index maintenance task: rebuilds the index on
    /// every revision bump and on a timer as a safety net.
    pub fn spawn_index_refresher(
        self: &std::sync::Arc<Self>,
        handle: std::sync::Arc<crate::utils::route_matcher::RouteIndexHandle>,
        refresh_interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        let mut revisions = self.subscribe();
        tokio::spawn(async move {
            loop {
                let routes = store.active_routes().await;
                let (index, errors) = crate::utils::route_matcher::RouteIndex::build(routes);
                for error in &errors {
                    warn!("Skipping route with bad pattern: {error}");
                }
                handle.replace(index);

                tokio::select! {
                    changed = revisions.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(refresh_interval) => {}
                }
            }
        })
    }

    fn bump_revision(&self) {
        self.revision_tx.send_modify(|rev| *rev += 1);
    }

    async fn persist(&self, tables: &Tables) -> Result<(), GatewayError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let state = GatewayState {
            routes: tables.routes.clone(),
            instances: tables.instances.clone(),
            circuits: tables.circuits.values().cloned().collect(),
            permissions: tables.permissions.clone(),
            grants: tables.grants.clone(),
            next_seq: tables.next_seq,
        };
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| GatewayError::Store(format!("failed to serialize state: {e}")))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| GatewayError::Store(format!("failed to write state file: {e}")))
    }

    /// Reachability check for the health endpoint: the snapshot
    /// directory must still exist for mutations to survive a restart.
    pub async fn ping(&self) -> bool {
        match &self.state_path {
            Some(path) => path
                .parent()
                .map(|dir| dir.as_os_str().is_empty() || dir.exists())
                .unwrap_or(true),
            None => true,
        }
    }

    // ---------------- routes ----------------

    pub async fn create_route(&self, req: RouteCreateRequest) -> Result<Route, GatewayError> {
        req.validate()
            .map_err(|message| GatewayError::Validation { message })?;

        let mut tables = self.tables.write().await;

        let conflict = tables.routes.iter().any(|r| {
            r.is_matchable() && r.path_pattern == req.path_pattern && r.method == req.method
        });
        if conflict {
            return Err(GatewayError::Validation {
                message: format!(
                    "path_pattern: active route already exists for {} {}",
                    req.method.as_str(),
                    req.path_pattern
                ),
            });
        }

        let seq = tables.next_seq;
        tables.next_seq += 1;

        let route = Route {
            id: Uuid::new_v4().to_string(),
            service_name: req.service_name,
            path_pattern: req.path_pattern,
            method: req.method,
            version: req.version,
            is_active: req.is_active,
            requires_auth: req.requires_auth,
            required_permissions: req.required_permissions,
            permission_check_strategy: req.permission_check_strategy,
            rate_limit_rpm: req.rate_limit_rpm,
            timeout_seconds: req.timeout_seconds,
            retry_count: req.retry_count,
            circuit_breaker_enabled: req.circuit_breaker_enabled,
            cache_enabled: req.cache_enabled,
            cache_ttl_seconds: req.cache_ttl_seconds,
            load_balance_strategy: req.load_balance_strategy,
            priority: req.priority,
            seq,
            status: RecordStatus::Active,
            created_at: Utc::now(),
            updated_at: None,
        };
        tables.routes.push(route.clone());

        self.persist(&tables).await?;
        drop(tables);
        self.bump_revision();
        Ok(route)
    }

    pub async fn list_routes(&self, service_name: Option<&str>) -> Vec<Route> {
        let tables = self.tables.read().await;
        tables
            .routes
            .iter()
            .filter(|r| r.status != RecordStatus::Deleted)
            .filter(|r| service_name.map(|s| r.service_name == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn get_route(&self, route_id: &str) -> Option<Route> {
        let tables = self.tables.read().await;
        tables
            .routes
            .iter()
            .find(|r| r.id == route_id && r.status != RecordStatus::Deleted)
            .cloned()
    }

    /// Routes eligible for matching, used by the index builder.
    pub async fn active_routes(&self) -> Vec<Route> {
        let tables = self.tables.read().await;
        tables
            .routes
            .iter()
            .filter(|r| r.is_matchable())
            .cloned()
            .collect()
    }

    pub async fn update_route(
        &self,
        route_id: &str,
        update: RouteUpdateRequest,
    ) -> Result<Route, GatewayError> {
        update
            .validate()
            .map_err(|message| GatewayError::Validation { message })?;

        let mut tables = self.tables.write().await;

        let position = tables
            .routes
            .iter()
            .position(|r| r.id == route_id && r.status != RecordStatus::Deleted)
            .ok_or_else(|| GatewayError::Validation {
                message: "id: route not found".to_string(),
            })?;

        let new_pattern = update
            .path_pattern
            .clone()
            .unwrap_or_else(|| tables.routes[position].path_pattern.clone());
        let new_method = update.method.unwrap_or(tables.routes[position].method);

        let conflict = tables.routes.iter().any(|r| {
            r.id != route_id
                && r.is_matchable()
                && r.path_pattern == new_pattern
                && r.method == new_method
        });
        if conflict {
            return Err(GatewayError::Validation {
                message: format!(
                    "path_pattern: active route already exists for {} {}",
                    new_method.as_str(),
                    new_pattern
                ),
            });
        }

        let route = &mut tables.routes[position];

        if let Some(v) = update.service_name {
            route.service_name = v;
        }
        if let Some(v) = update.path_pattern {
            route.path_pattern = v;
        }
        if let Some(v) = update.method {
            route.method = v;
        }
        if let Some(v) = update.version {
            route.version = v;
        }
        if let Some(v) = update.is_active {
            route.is_active = v;
        }
        if let Some(v) = update.requires_auth {
            route.requires_auth = v;
        }
        if let Some(v) = update.required_permissions {
            route.required_permissions = v;
        }
        if let Some(v) = update.permission_check_strategy {
            route.permission_check_strategy = v;
        }
        if let Some(v) = update.rate_limit_rpm {
            route.rate_limit_rpm = v;
        }
        if let Some(v) = update.timeout_seconds {
            route.timeout_seconds = v;
        }
        if let Some(v) = update.retry_count {
            route.retry_count = v;
        }
        if let Some(v) = update.circuit_breaker_enabled {
            route.circuit_breaker_enabled = v;
        }
        if let Some(v) = update.cache_enabled {
            route.cache_enabled = v;
        }
        if let Some(v) = update.cache_ttl_seconds {
            route.cache_ttl_seconds = v;
        }
        if let Some(v) = update.load_balance_strategy {
            route.load_balance_strategy = v;
        }
        if let Some(v) = update.priority {
            route.priority = v;
        }
        route.updated_at = Some(Utc::now());
        let updated = route.clone();

        self.persist(&tables).await?;
        drop(tables);
        self.bump_revision();
        Ok(updated)
    }

    pub async fn delete_route(&self, route_id: &str) -> Result<(), GatewayError> {
        let mut tables = self.tables.write().await;
        let route = tables
            .routes
            .iter_mut()
            .find(|r| r.id == route_id && r.status != RecordStatus::Deleted)
            .ok_or_else(|| GatewayError::Validation {
                message: "id: route not found".to_string(),
            })?;
        route.status = RecordStatus::Deleted;
        route.is_active = false;
        route.updated_at = Some(Utc::now());

        self.persist(&tables).await?;
        drop(tables);
        self.bump_revision();
        Ok(())
    }

    // ---------------- service instances ----------------

    pub async fn register_instance(
        &self,
        req: InstanceRegisterRequest,
    ) -> Result<ServiceInstance, GatewayError> {
        req.validate()
            .map_err(|message| GatewayError::Validation { message })?;

        let mut tables = self.tables.write().await;

        let conflict = tables.instances.iter().any(|i| {
            i.is_registered()
                && i.service_name == req.service_name
                && i.instance_id == req.instance_id
        });
        if conflict {
            return Err(GatewayError::Validation {
                message: format!(
                    "instance_id: {} is already registered for service {}",
                    req.instance_id, req.service_name
                ),
            });
        }

        let instance = ServiceInstance {
            id: Uuid::new_v4().to_string(),
            service_name: req.service_name,
            instance_id: req.instance_id,
            host: req.host,
            port: req.port,
            protocol: req.protocol,
            weight: req.weight,
            instance_status: InstanceStatus::Healthy,
            last_health_check: None,
            health_check_url: req.health_check_url,
            health_check_interval_seconds: req.health_check_interval_seconds,
            metadata: req.metadata,
            registered_at: Utc::now(),
            status: RecordStatus::Active,
            updated_at: None,
        };
        tables.instances.push(instance.clone());

        self.persist(&tables).await?;
        Ok(instance)
    }

    pub async fn list_instances(&self, service_name: Option<&str>) -> Vec<ServiceInstance> {
        let tables = self.tables.read().await;
        tables
            .instances
            .iter()
            .filter(|i| i.is_registered())
            .filter(|i| service_name.map(|s| i.service_name == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Instances eligible to receive new traffic for a service.
    pub async fn healthy_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let tables = self.tables.read().await;
        tables
            .instances
            .iter()
            .filter(|i| i.service_name == service_name && i.is_healthy())
            .cloned()
            .collect()
    }

    pub async fn deregister_instance(&self, id: &str) -> Result<(), GatewayError> {
        let mut tables = self.tables.write().await;
        let instance = tables
            .instances
            .iter_mut()
            .find(|i| i.id == id && i.is_registered())
            .ok_or_else(|| GatewayError::Validation {
                message: "id: service instance not found".to_string(),
            })?;
        instance.status = RecordStatus::Deleted;
        instance.updated_at = Some(Utc::now());
        self.persist(&tables).await
    }

    /// Marks an instance as draining: no new traffic, in-flight requests
    /// may finish.
    pub async fn drain_instance(&self, id: &str) -> Result<(), GatewayError> {
        let mut tables = self.tables.write().await;
        let instance = tables
            .instances
            .iter_mut()
            .find(|i| i.id == id && i.is_registered())
            .ok_or_else(|| GatewayError::Validation {
                message: "id: service instance not found".to_string(),
            })?;
        instance.instance_status = InstanceStatus::Draining;
        instance.updated_at = Some(Utc::now());
        self.persist(&tables).await
    }

    /// Health-loop write path. Returns the previous status.
    pub async fn set_instance_health(
        &self,
        id: &str,
        status: InstanceStatus,
    ) -> Result<InstanceStatus, GatewayError> {
        let mut tables = self.tables.write().await;
        let instance = tables
            .instances
            .iter_mut()
            .find(|i| i.id == id && i.is_registered())
            .ok_or_else(|| GatewayError::Validation {
                message: "id: service instance not found".to_string(),
            })?;
        let previous = instance.instance_status;
        instance.instance_status = status;
        instance.last_health_check = Some(Utc::now());
        instance.updated_at = Some(Utc::now());
        self.persist(&tables).await?;
        Ok(previous)
    }

    // ---------------- circuit breaker rows ----------------

    pub async fn save_circuit(&self, record: CircuitBreakerRecord) -> Result<(), GatewayError> {
        let mut tables = self.tables.write().await;
        tables
            .circuits
            .insert(record.service_name.clone(), record);
        if let Err(e) = self.persist(&tables).await {
            // Breaker rows are observability mirrors; a failed snapshot
            // must not fail the request that triggered the transition.
            warn!("Failed to persist circuit breaker state: {e}");
        }
        Ok(())
    }

    pub async fn get_circuit(&self, service_name: &str) -> Option<CircuitBreakerRecord> {
        let tables = self.tables.read().await;
        tables.circuits.get(service_name).cloned()
    }

    pub async fn list_circuits(&self) -> Vec<CircuitBreakerRecord> {
        let tables = self.tables.read().await;
        tables.circuits.values().cloned().collect()
    }

    // ---------------- permissions ----------------

    pub async fn create_permission(
        &self,
        req: PermissionCreateRequest,
    ) -> Result<Permission, GatewayError> {
        req.validate()
            .map_err(|message| GatewayError::Validation { message })?;

        let mut tables = self.tables.write().await;
        let exists = tables.permissions.iter().any(|p| {
            p.status == RecordStatus::Active && p.permission_code == req.permission_code
        });
        if exists {
            return Err(GatewayError::Validation {
                message: format!("permission_code: {} already exists", req.permission_code),
            });
        }

        let permission = Permission {
            id: Uuid::new_v4().to_string(),
            permission_code: req.permission_code,
            permission_name: req.permission_name,
            description: req.description,
            resource_type: req.resource_type,
            actions: req.actions,
            is_system: req.is_system,
            status: RecordStatus::Active,
            created_at: Utc::now(),
        };
        tables.permissions.push(permission.clone());
        self.persist(&tables).await?;
        Ok(permission)
    }

    /// Grants every listed permission code to the user; unknown codes
    /// fail the whole request before anything is written.
    pub async fn grant_permissions(
        &self,
        req: PermissionGrantRequest,
        granted_by: Option<String>,
    ) -> Result<usize, GatewayError> {
        req.validate()
            .map_err(|message| GatewayError::Validation { message })?;

        let mut tables = self.tables.write().await;

        let mut permission_ids = Vec::with_capacity(req.permission_codes.len());
        for code in &req.permission_codes {
            let permission = tables
                .permissions
                .iter()
                .find(|p| p.status == RecordStatus::Active && &p.permission_code == code)
                .ok_or_else(|| GatewayError::Validation {
                    message: format!("permission_codes: unknown permission {code}"),
                })?;
            permission_ids.push(permission.id.clone());
        }

        let now = Utc::now();
        let mut granted = 0;
        for permission_id in permission_ids {
            let duplicate = tables.grants.iter().any(|g| {
                g.status == RecordStatus::Active
                    && g.user_id == req.user_id
                    && g.permission_id == permission_id
            });
            if duplicate {
                continue;
            }
            tables.grants.push(UserPermissionGrant {
                id: Uuid::new_v4().to_string(),
                user_id: req.user_id.clone(),
                role: req.role.clone(),
                permission_id,
                granted_by: granted_by.clone(),
                granted_at: now,
                expires_at: req.expires_at,
                status: RecordStatus::Active,
            });
            granted += 1;
        }

        self.persist(&tables).await?;
        Ok(granted)
    }

    /// Effective permission codes for a user at this moment.
    pub async fn user_permission_codes(&self, user_id: &str) -> HashSet<String> {
        let tables = self.tables.read().await;
        let now = Utc::now();
        let by_id: HashMap<&str, &Permission> = tables
            .permissions
            .iter()
            .filter(|p| p.status == RecordStatus::Active)
            .map(|p| (p.id.as_str(), p))
            .collect();

        tables
            .grants
            .iter()
            .filter(|g| g.user_id == user_id && g.is_effective(now))
            .filter_map(|g| by_id.get(g.permission_id.as_str()))
            .map(|p| p.permission_code.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::RouteMethod;
    use serde_json::json;

    fn route_req(pattern: &str, method: RouteMethod) -> RouteCreateRequest {
        serde_json::from_value(json!({
            "service_name": "user_service",
            "path_pattern": pattern,
            "method": method.as_str(),
            "requires_auth": false
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_active_pattern_and_method_is_rejected() {
        let store = RouteStore::in_memory();
        store
            .create_route(route_req("/api/v1/users", RouteMethod::Get))
            .await
            .unwrap();

        let err = store
            .create_route(route_req("/api/v1/users", RouteMethod::Get))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));

        // Same pattern under a different method is fine.
        store
            .create_route(route_req("/api/v1/users", RouteMethod::Post))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn soft_delete_frees_the_pattern() {
        let store = RouteStore::in_memory();
        let route = store
            .create_route(route_req("/api/v1/users", RouteMethod::Get))
            .await
            .unwrap();

        store.delete_route(&route.id).await.unwrap();
        assert!(store.get_route(&route.id).await.is_none());
        assert!(store.active_routes().await.is_empty());

        // The pattern can be reused once the old route is gone.
        store
            .create_route(route_req("/api/v1/users", RouteMethod::Get))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn route_mutations_bump_the_revision() {
        let store = RouteStore::in_memory();
        let rx = store.subscribe();
        assert_eq!(*rx.borrow(), 0);

        let route = store
            .create_route(route_req("/api/v1/users", RouteMethod::Get))
            .await
            .unwrap();
        assert_eq!(*rx.borrow(), 1);

        store
            .update_route(
                &route.id,
                RouteUpdateRequest {
                    priority: Some(9),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(*rx.borrow(), 2);

        store.delete_route(&route.id).await.unwrap();
        assert_eq!(*rx.borrow(), 3);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = RouteStore::open(&path).await.unwrap();
            store
                .create_route(route_req("/api/v1/users", RouteMethod::Get))
                .await
                .unwrap();
            store
                .register_instance(
                    serde_json::from_value(json!({
                        "service_name": "user_service",
                        "instance_id": "u-1",
                        "host": "127.0.0.1",
                        "port": 9001
                    }))
                    .unwrap(),
                )
                .await
                .unwrap();
        }

        let store = RouteStore::open(&path).await.unwrap();
        assert_eq!(store.active_routes().await.len(), 1);
        assert_eq!(store.healthy_instances("user_service").await.len(), 1);
    }

    #[tokio::test]
    async fn draining_instances_take_no_new_traffic() {
        let store = RouteStore::in_memory();
        let instance = store
            .register_instance(
                serde_json::from_value(json!({
                    "service_name": "orders",
                    "instance_id": "o-1",
                    "host": "127.0.0.1",
                    "port": 9002
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(store.healthy_instances("orders").await.len(), 1);
        store.drain_instance(&instance.id).await.unwrap();
        assert!(store.healthy_instances("orders").await.is_empty());
        // Still registered, just not eligible.
        assert_eq!(store.list_instances(Some("orders")).await.len(), 1);
    }

    #[tokio::test]
    async fn permission_grants_respect_expiry_and_dedup() {
        let store = RouteStore::in_memory();
        store
            .create_permission(
                serde_json::from_value(json!({
                    "permission_code": "user.read",
                    "permission_name": "Read users"
                }))
                .unwrap(),
            )
            .await
            .unwrap();

        let grant: PermissionGrantRequest = serde_json::from_value(json!({
            "user_id": "u1",
            "permission_codes": ["user.read"],
            "role": "user"
        }))
        .unwrap();

        assert_eq!(store.grant_permissions(grant.clone(), None).await.unwrap(), 1);
        // Granting again is a no-op.
        assert_eq!(store.grant_permissions(grant, None).await.unwrap(), 0);

        let codes = store.user_permission_codes("u1").await;
        assert!(codes.contains("user.read"));
        assert!(store.user_permission_codes("u2").await.is_empty());
    }
}
