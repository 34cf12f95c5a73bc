//! Catch-all ingress route wired to the proxy engine.

use actix_web::{web, HttpRequest, HttpResponse};

use crate::services::proxy::ProxyEngine;

async fn proxy_entry(
    req: HttpRequest,
    body: web::Bytes,
    engine: web::Data<ProxyEngine>,
) -> HttpResponse {
    engine.handle(req, body).await
}

/// Registers the default service: every path that no operational or
/// admin endpoint claims goes through the proxy pipeline. Payloads are
/// capped at 1MB to guard against memory exhaustion.
pub fn configure_gateway(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::PayloadConfig::new(1024 * 1024))
        .default_service(web::route().to(proxy_entry));
}
