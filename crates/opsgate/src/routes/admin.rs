//! Admin API: route CRUD, service instance registration, permission
//! management, and operational queries (call logs, circuit states).
//!
//! Every endpoint requires a bearer token whose `role` claim grants
//! admin access. Schema violations come back as the compatibility
//! envelope: HTTP 200 with code `F10001` and the first field-level
//! message.

use actix_web::{delete, get, post, put, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::config::GatewayConfig;
use crate::models::call_log::CallLog;
use crate::models::envelope::ApiResponse;
use crate::models::error::{AuthFailure, GatewayError};
use crate::models::instance::{BatchInstanceRegisterRequest, InstanceRegisterRequest};
use crate::models::permission::{PermissionCreateRequest, PermissionGrantRequest};
use crate::models::route::{BatchRouteCreateRequest, RouteCreateRequest, RouteUpdateRequest};
use crate::services::registry::ServiceRegistry;
use crate::services::token_validator::{TokenValidator, ValidatedUser};
use crate::store::RouteStore;

/// Roles allowed to manage routes and services.
const MANAGEMENT_ROLES: &[&str] = &["admin", "service_admin"];

/// Rewrites JSON body deserialization failures into the validation
/// envelope so admin clients keep a single error shape.
pub fn json_error_handler(
    err: actix_web::error::JsonPayloadError,
    _req: &HttpRequest,
) -> actix_web::Error {
    let message = match &err {
        actix_web::error::JsonPayloadError::Deserialize(e) => e.to_string(),
        other => other.to_string(),
    };
    GatewayError::Validation { message }.into()
}

async fn require_role(
    req: &HttpRequest,
    validator: &TokenValidator,
    roles: &[&str],
) -> Result<ValidatedUser, GatewayError> {
    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());

    let outcome = validator
        .validate(bearer.as_deref(), true)
        .await
        .map_err(GatewayError::Unauthorized)?;
    let user = outcome
        .user()
        .cloned()
        .ok_or(GatewayError::Unauthorized(AuthFailure::Missing))?;

    if roles.contains(&user.role.as_str()) {
        Ok(user)
    } else {
        Err(GatewayError::Forbidden {
            user_id: user.user_id,
        })
    }
}

// ---------------- routes ----------------

#[post("/admin/routes")]
pub async fn create_route(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
    body: web::Json<RouteCreateRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    let route = store.create_route(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(ApiResponse::success_msg(
        "Route created",
        serde_json::to_value(&route).unwrap_or_default(),
    )))
}

#[derive(Deserialize)]
pub struct RouteQuery {
    pub service_name: Option<String>,
}

#[get("/admin/routes")]
pub async fn list_routes(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
    query: web::Query<RouteQuery>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    let routes = store.list_routes(query.service_name.as_deref()).await;
    Ok(HttpResponse::Ok().json(ApiResponse::success(json!({
        "total": routes.len(),
        "routes": routes,
    }))))
}

#[put("/admin/routes/{id}")]
pub async fn update_route(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
    path: web::Path<String>,
    body: web::Json<RouteUpdateRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    let route = store.update_route(&path, body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success_msg(
        "Route updated",
        serde_json::to_value(&route).unwrap_or_default(),
    )))
}

#[delete("/admin/routes/{id}")]
pub async fn delete_route(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    store.delete_route(&path).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success_msg("Route deleted", json!({}))))
}

#[post("/admin/batch/routes")]
pub async fn batch_create_routes(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
    body: web::Json<BatchRouteCreateRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    let batch = body.into_inner();
    batch
        .validate()
        .map_err(|message| GatewayError::Validation { message })?;

    let mut created = Vec::with_capacity(batch.routes.len());
    for route_req in batch.routes {
        created.push(store.create_route(route_req).await?);
    }
    Ok(HttpResponse::Created().json(ApiResponse::success(json!({
        "created": created.len(),
        "routes": created,
    }))))
}

// ---------------- service instances ----------------

#[post("/admin/services")]
pub async fn register_service(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    registry: web::Data<ServiceRegistry>,
    body: web::Json<InstanceRegisterRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    let instance = registry.register(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(ApiResponse::success_msg(
        "Service instance registered",
        serde_json::to_value(&instance).unwrap_or_default(),
    )))
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    pub service_name: Option<String>,
}

#[get("/admin/services")]
pub async fn list_services(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
    query: web::Query<ServiceQuery>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    let instances = store.list_instances(query.service_name.as_deref()).await;
    Ok(HttpResponse::Ok().json(ApiResponse::success(json!({
        "total": instances.len(),
        "instances": instances,
    }))))
}

#[delete("/admin/services/{id}")]
pub async fn deregister_service(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    registry: web::Data<ServiceRegistry>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    registry.deregister(&path).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success_msg(
        "Service instance deregistered",
        json!({}),
    )))
}

#[post("/admin/services/{id}/drain")]
pub async fn drain_service(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    registry: web::Data<ServiceRegistry>,
    path: web::Path<String>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    registry.drain(&path).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success_msg(
        "Service instance draining",
        json!({}),
    )))
}

#[post("/admin/batch/services")]
pub async fn batch_register_services(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    registry: web::Data<ServiceRegistry>,
    body: web::Json<BatchInstanceRegisterRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    let instances = registry.register_batch(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(ApiResponse::success(json!({
        "registered": instances.len(),
        "instances": instances,
    }))))
}

// ---------------- permissions ----------------

#[post("/admin/permissions")]
pub async fn create_permission(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
    body: web::Json<PermissionCreateRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, &["admin"]).await?;
    let permission = store.create_permission(body.into_inner()).await?;
    Ok(HttpResponse::Created().json(ApiResponse::success_msg(
        "Permission created",
        serde_json::to_value(&permission).unwrap_or_default(),
    )))
}

#[post("/admin/permissions/grant")]
pub async fn grant_permissions(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
    body: web::Json<PermissionGrantRequest>,
) -> Result<HttpResponse, GatewayError> {
    let admin = require_role(&req, &validator, &["admin"]).await?;
    let granted = store
        .grant_permissions(body.into_inner(), Some(admin.user_id))
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::success(json!({"granted": granted}))))
}

// ---------------- operational queries ----------------

#[derive(Deserialize)]
pub struct LogQuery {
    pub user_id: Option<String>,
    pub service_name: Option<String>,
    pub status_code: Option<u16>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_size")]
    pub size: usize,
}

fn default_page() -> usize {
    1
}

fn default_size() -> usize {
    20
}

/// Reads back the call-log file, newest first, with simple filters.
#[get("/admin/logs")]
pub async fn query_logs(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    config: web::Data<GatewayConfig>,
    query: web::Query<LogQuery>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;

    let size = query.size.clamp(1, 100);
    let page = query.page.max(1);

    let raw = match tokio::fs::read_to_string(&config.call_log_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(GatewayError::Store(e.to_string())),
    };

    let mut logs: Vec<CallLog> = raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .filter(|log: &CallLog| {
            query
                .user_id
                .as_ref()
                .map(|u| log.user_id.as_ref() == Some(u))
                .unwrap_or(true)
                && query
                    .service_name
                    .as_ref()
                    .map(|s| log.target_service.as_ref() == Some(s))
                    .unwrap_or(true)
                && query
                    .status_code
                    .map(|c| log.response_status == Some(c))
                    .unwrap_or(true)
        })
        .collect();
    logs.reverse();

    let total = logs.len();
    let logs: Vec<CallLog> = logs
        .into_iter()
        .skip((page - 1) * size)
        .take(size)
        .collect();

    Ok(HttpResponse::Ok().json(ApiResponse::success(json!({
        "total": total,
        "page": page,
        "size": size,
        "logs": logs,
    }))))
}

#[get("/admin/circuits")]
pub async fn list_circuits(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
    store: web::Data<RouteStore>,
) -> Result<HttpResponse, GatewayError> {
    require_role(&req, &validator, MANAGEMENT_ROLES).await?;
    let circuits = store.list_circuits().await;
    Ok(HttpResponse::Ok().json(ApiResponse::success(json!({
        "total": circuits.len(),
        "circuits": circuits,
    }))))
}

pub fn configure_admin(cfg: &mut web::ServiceConfig) {
    cfg.service(create_route)
        .service(list_routes)
        .service(update_route)
        .service(delete_route)
        .service(batch_create_routes)
        .service(register_service)
        .service(list_services)
        .service(deregister_service)
        .service(drain_service)
        .service(batch_register_services)
        .service(create_permission)
        .service(grant_permissions)
        .service(query_logs)
        .service(list_circuits);
}
