//! Gateway-local auth endpoints and the documentation page.

use actix_web::{get, post, web, HttpRequest, HttpResponse};
use serde_json::json;

use crate::models::envelope::ApiResponse;
use crate::models::error::{AuthFailure, GatewayError};
use crate::services::token_validator::TokenValidator;

/// `POST /auth/logout`: revokes the presented bearer token. The `jti`
/// enters the revocation set for the remainder of the token's lifetime,
/// so a previously cached validation can never succeed again.
#[post("/auth/logout")]
pub async fn logout(
    req: HttpRequest,
    validator: web::Data<TokenValidator>,
) -> Result<HttpResponse, GatewayError> {
    let bearer = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .ok_or(GatewayError::Unauthorized(AuthFailure::Missing))?;

    validator
        .revoke(&bearer)
        .await
        .map_err(GatewayError::Unauthorized)?;

    Ok(HttpResponse::Ok().json(ApiResponse::success_msg("Logged out", json!({}))))
}

/// Minimal human-readable API documentation.
#[get("/swagger-ui")]
pub async fn swagger_ui() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(DOCS_HTML)
}

const DOCS_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Opsgate API Gateway</title>
  <style>
    body { font-family: sans-serif; margin: 2rem auto; max-width: 56rem; }
    code { background: #f2f2f2; padding: 0.1rem 0.3rem; }
    th, td { text-align: left; padding: 0.3rem 0.8rem 0.3rem 0; }
  </style>
</head>
<body>
  <h1>Opsgate API Gateway</h1>
  <p>Central entry point for DevOps Central services. All gateway
  responses use the <code>{code, msg, content}</code> envelope.</p>
  <h2>Operational endpoints</h2>
  <table>
    <tr><th>Endpoint</th><th>Description</th></tr>
    <tr><td><code>GET /health</code></td><td>Store/cache reachability, route and instance counts</td></tr>
    <tr><td><code>GET /ready</code>, <code>GET /live</code></td><td>Kubernetes probes</td></tr>
    <tr><td><code>GET /metrics</code></td><td>Prometheus text exposition</td></tr>
    <tr><td><code>POST /auth/logout</code></td><td>Revoke the presented bearer token</td></tr>
  </table>
  <h2>Admin endpoints (admin bearer token)</h2>
  <table>
    <tr><td><code>POST/GET /admin/routes</code>, <code>PUT/DELETE /admin/routes/{id}</code></td><td>Route CRUD</td></tr>
    <tr><td><code>POST /admin/batch/routes</code></td><td>Batch route creation (max 50)</td></tr>
    <tr><td><code>POST/GET /admin/services</code>, <code>DELETE /admin/services/{id}</code></td><td>Instance registration</td></tr>
    <tr><td><code>POST /admin/services/{id}/drain</code></td><td>Stop new traffic to an instance</td></tr>
    <tr><td><code>POST /admin/batch/services</code></td><td>Batch registration (max 20)</td></tr>
    <tr><td><code>POST /admin/permissions</code>, <code>POST /admin/permissions/grant</code></td><td>Permission catalog and grants</td></tr>
    <tr><td><code>GET /admin/logs</code></td><td>Call-log queries</td></tr>
    <tr><td><code>GET /admin/circuits</code></td><td>Circuit breaker states</td></tr>
  </table>
  <p>Any other path is matched against the active route table and
  forwarded to the owning service.</p>
</body>
</html>
"#;

pub fn configure_auth(cfg: &mut web::ServiceConfig) {
    cfg.service(logout).service(swagger_ui);
}
