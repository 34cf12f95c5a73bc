//! Liveness and readiness endpoints.

use actix_web::{web, HttpResponse, Result};
use serde_json::json;

use crate::cache::SharedCache;
use crate::store::RouteStore;
use crate::utils::route_matcher::RouteIndexHandle;

/// `GET /health`: overall service health with store and cache
/// reachability, active route count, and healthy instance count.
pub async fn health_check(
    store: web::Data<RouteStore>,
    cache: web::Data<SharedCache>,
    index: web::Data<RouteIndexHandle>,
) -> Result<HttpResponse> {
    let mut issues: Vec<String> = Vec::new();

    let database = if store.ping().await {
        "connected"
    } else {
        issues.push("state store unreachable".to_string());
        "error"
    };

    let cache_status = match cache.ping().await {
        Ok(()) => "connected",
        Err(_) => {
            issues.push("cache unreachable".to_string());
            "error"
        }
    };

    let active_routes = index.snapshot().len();
    let healthy_instances = store
        .list_instances(None)
        .await
        .iter()
        .filter(|i| i.is_healthy())
        .count();

    let status = if issues.is_empty() { "healthy" } else { "degraded" };

    Ok(HttpResponse::Ok().json(json!({
        "status": status,
        "service": "opsgate",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "database": database,
        "cache": cache_status,
        "active_routes": active_routes,
        "healthy_instances": healthy_instances,
        "issues": issues,
    })))
}

/// Kubernetes readiness probe.
pub async fn readiness_check(store: web::Data<RouteStore>) -> Result<HttpResponse> {
    if store.ping().await {
        Ok(HttpResponse::Ok().json(json!({
            "status": "ready",
            "timestamp": chrono::Utc::now().to_rfc3339()
        })))
    } else {
        Ok(HttpResponse::ServiceUnavailable().json(json!({
            "status": "not_ready",
            "timestamp": chrono::Utc::now().to_rfc3339()
        })))
    }
}

/// Kubernetes liveness probe. Only fails when the process is broken.
pub async fn liveness_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "alive",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

pub fn configure_health(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/ready", web::get().to(readiness_check))
        .route("/live", web::get().to(liveness_check));
}
