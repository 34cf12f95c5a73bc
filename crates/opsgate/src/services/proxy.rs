//! The proxy engine: the composed per-request pipeline.
//!
//! Order per request: request id, CORS preflight short-circuit, route
//! match, auth, permission check, rate limit, circuit breaker gate,
//! response cache, load balance, forward. The first failing stage
//! short-circuits into the envelope translator; every completed request
//! enqueues a call-log record without blocking the response.
//!
//! Retries live here and nowhere else: idempotent methods only, on
//! network errors and upstream 5xx, with exponential backoff bounded by
//! the route's remaining deadline budget. Client disconnects release
//! held counters, log status 499, and do not count against the breaker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::http::{Method as ActixMethod, StatusCode};
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use chrono::Utc;
use log::{debug, warn};
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap as ReqwestHeaderMap, HeaderName, HeaderValue};
use reqwest::Method as ReqwestMethod;
use serde_json::json;

use crate::config::GatewayConfig;
use crate::middleware::request_id::RequestContext;
use crate::models::call_log::CallLog;
use crate::models::error::GatewayError;
use crate::models::route::Route;
use crate::routes::metrics::MetricsCollector;
use crate::services::call_logger::CallLogger;
use crate::services::circuit_breaker::{BreakerPermit, CircuitBreakerRegistry, PermitKind};
use crate::services::load_balancer::LoadBalancer;
use crate::services::permissions::PermissionChecker;
use crate::services::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::services::response_cache::ResponseCache;
use crate::services::token_validator::{AuthOutcome, TokenValidator};
use crate::store::RouteStore;
use crate::utils::path::build_target_url;
use crate::utils::route_matcher::RouteIndexHandle;

/// Responses with a known length above this are streamed to the client
/// instead of buffered.
const STREAM_THRESHOLD_BYTES: u64 = 256 * 1024;

/// Hop-by-hop headers, stripped in both directions.
static HOP_BY_HOP: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "host",
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ]
});

/// The gateway object threaded through request handlers. Explicitly
/// constructed once at startup; every collaborator is injected.
pub struct ProxyEngine {
    config: GatewayConfig,
    client: reqwest::Client,
    index: Arc<RouteIndexHandle>,
    store: Arc<RouteStore>,
    validator: Arc<TokenValidator>,
    permissions: Arc<PermissionChecker>,
    rate_limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    balancer: Arc<LoadBalancer>,
    response_cache: Arc<ResponseCache>,
    call_logger: Arc<CallLogger>,
    metrics: MetricsCollector,
}

/// Holds the call-log record and breaker permit while the request is in
/// flight. If the handler future is dropped (client disconnect), the
/// drop impl logs status 499 and hands back the breaker permit without
/// counting a failure.
struct InFlightRequest {
    record: Option<CallLog>,
    permit: Option<BreakerPermit>,
    call_logger: Arc<CallLogger>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: MetricsCollector,
    started: Instant,
}

impl InFlightRequest {
    fn disarm(&mut self) -> (CallLog, Option<BreakerPermit>) {
        let record = self.record.take().unwrap_or_else(|| {
            CallLog::new(String::new(), String::new(), String::new())
        });
        (record, self.permit.take())
    }

    fn record_mut(&mut self) -> &mut CallLog {
        // The record is only taken in disarm, after which the guard is
        // never touched again.
        self.record.as_mut().expect("request already disarmed")
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        // Client went away mid-pipeline.
        record.response_status = Some(499);
        record.response_time_ms = Some(self.started.elapsed().as_millis() as u64);
        record.completed_at = Some(Utc::now());
        record.error_message = Some("client closed request".to_string());
        self.call_logger.enqueue(record);

        if let Some(permit) = self.permit.take() {
            self.breakers.release_cancelled_sync(&permit);
        }
        self.metrics.decrement_connections();
    }
}

impl ProxyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GatewayConfig,
        index: Arc<RouteIndexHandle>,
        store: Arc<RouteStore>,
        validator: Arc<TokenValidator>,
        permissions: Arc<PermissionChecker>,
        rate_limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        balancer: Arc<LoadBalancer>,
        response_cache: Arc<ResponseCache>,
        call_logger: Arc<CallLogger>,
        metrics: MetricsCollector,
    ) -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .build()
            .unwrap_or_default();

        Self {
            config,
            client,
            index,
            store,
            validator,
            permissions,
            rate_limiter,
            breakers,
            balancer,
            response_cache,
            call_logger,
            metrics,
        }
    }

    /// Entry point for the catch-all ingress route.
    pub async fn handle(&self, req: HttpRequest, body: web::Bytes) -> HttpResponse {
        let context = req
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_else(|| RequestContext {
                request_id: uuid::Uuid::new_v4().to_string(),
                started: Instant::now(),
            });

        if *req.method() == ActixMethod::OPTIONS {
            return self.preflight(&req);
        }

        self.metrics.increment_connections();

        let mut record = CallLog::new(
            context.request_id.clone(),
            req.method().to_string(),
            req.path().to_string(),
        );
        if !req.query_string().is_empty() {
            record.query_params = Some(json!(req.query_string()));
        }
        record.ip_address = req
            .connection_info()
            .realip_remote_addr()
            .map(|s| s.to_string());
        record.user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        record.headers = Some(json!({
            "content-type": header_str(&req, "content-type"),
            "accept": header_str(&req, "accept"),
            "referer": header_str(&req, "referer"),
        }));

        let mut in_flight = InFlightRequest {
            record: Some(record),
            permit: None,
            call_logger: self.call_logger.clone(),
            breakers: self.breakers.clone(),
            metrics: self.metrics.clone(),
            started: context.started,
        };

        let outcome = self.pipeline(&req, body, &context, &mut in_flight).await;

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    GatewayError::RateLimited { .. } => self.metrics.record_rate_limited(),
                    GatewayError::CircuitOpen { .. } => self.metrics.record_circuit_open(),
                    GatewayError::UpstreamTimeout { .. } => {
                        self.metrics.record_upstream_timeout()
                    }
                    _ => {}
                }
                in_flight.record_mut().error_message = Some(err.to_string());
                actix_web::error::ResponseError::error_response(&err)
            }
        };

        let elapsed = context.started.elapsed();
        let (mut record, _permit) = in_flight.disarm();
        record.response_status = Some(response.status().as_u16());
        record.response_time_ms = Some(elapsed.as_millis() as u64);
        record.completed_at = Some(Utc::now());

        self.metrics
            .record_request(response.status().as_u16(), elapsed);
        self.metrics.decrement_connections();
        self.call_logger.enqueue(record);

        response
    }

    /// CORS preflight short-circuit with the standard header set.
    fn preflight(&self, req: &HttpRequest) -> HttpResponse {
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("*");
        let allowed = self.config.origin_allowed(origin);

        let mut builder = HttpResponse::Ok();
        if allowed {
            builder.insert_header(("Access-Control-Allow-Origin", origin));
            builder.insert_header((
                "Access-Control-Allow-Methods",
                "GET,POST,PUT,DELETE,PATCH,OPTIONS",
            ));
            builder.insert_header((
                "Access-Control-Allow-Headers",
                "Content-Type,Authorization,X-Request-ID,x-request-id",
            ));
            builder.insert_header(("Access-Control-Allow-Credentials", "true"));
            builder.insert_header(("Access-Control-Max-Age", "3600"));
        }
        builder.json(json!({"status": "ok"}))
    }

    async fn pipeline(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
        context: &RequestContext,
        in_flight: &mut InFlightRequest,
    ) -> Result<HttpResponse, GatewayError> {
        let method = req.method().as_str().to_string();
        let path = req.path().to_string();

        // Route match.
        let snapshot = self.index.snapshot();
        let matched = snapshot
            .find_match(&method, &path)
            .ok_or_else(|| GatewayError::RouteNotFound { path: path.clone() })?;
        let route = matched.route;
        in_flight.record_mut().target_service = Some(route.service_name.clone());

        // Auth. Routes without auth still get best-effort identity so
        // rate limiting can key on the user.
        let bearer = bearer_token(req);
        let auth = if route.requires_auth {
            self.validator
                .validate(bearer.as_deref(), true)
                .await
                .map_err(GatewayError::Unauthorized)?
        } else {
            self.validator
                .validate(bearer.as_deref(), false)
                .await
                .unwrap_or(AuthOutcome::Anonymous)
        };
        if let Some(user) = auth.user() {
            in_flight.record_mut().user_id = Some(user.user_id.clone());
        }

        // Permission check.
        if !route.required_permissions.is_empty() {
            let user = auth
                .user()
                .ok_or(GatewayError::Unauthorized(
                    crate::models::error::AuthFailure::Missing,
                ))?;
            let check = self
                .permissions
                .require(
                    &user.user_id,
                    &route.required_permissions,
                    route.permission_check_strategy,
                )
                .await;
            match check {
                Ok(result) => {
                    in_flight.record_mut().permission_check_result = Some(result.detail);
                }
                Err(err) => {
                    in_flight.record_mut().permission_check_result =
                        Some(json!({"granted": false}));
                    return Err(err);
                }
            }
        }

        // Rate limit, keyed on user id when authenticated, else client IP.
        let identifier = auth
            .user()
            .map(|u| u.user_id.clone())
            .or_else(|| {
                req.connection_info()
                    .realip_remote_addr()
                    .map(|s| s.to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());
        // Hand-edited state files may carry zeroed policies; fall back
        // to the configured defaults.
        let limit = if route.rate_limit_rpm > 0 {
            route.rate_limit_rpm
        } else {
            self.config.default_rate_limit_rpm
        };
        let decision = self
            .rate_limiter
            .check(
                &identifier,
                &route.path_pattern,
                limit,
                self.config.default_rate_limit_window,
            )
            .await;
        if !decision.allowed {
            return Err(GatewayError::RateLimited {
                limit: decision.limit,
                window: decision.window_seconds,
                retry_after: decision.retry_after,
            });
        }

        // Response cache lookup for idempotent reads.
        let cache_key = (route.cache_enabled && method == "GET").then(|| {
            ResponseCache::cache_key(
                &route.id,
                &path,
                req.query_string(),
                header_str(req, "accept").as_deref(),
                header_str(req, "accept-encoding").as_deref(),
                route
                    .requires_auth
                    .then(|| auth.user().map(|u| u.user_id.as_str()))
                    .flatten(),
            )
        });
        if let Some(key) = &cache_key {
            if let Some(hit) = self.response_cache.lookup(key).await {
                self.metrics.record_cache_hit();
                debug!("Response cache hit for {path} [{}]", context.request_id);
                let mut builder = HttpResponse::build(
                    StatusCode::from_u16(hit.status).unwrap_or(StatusCode::OK),
                );
                for (name, value) in &hit.headers {
                    builder.insert_header((name.as_str(), value.as_str()));
                }
                builder.insert_header(("X-Cache", "HIT"));
                rate_limit_headers(&mut builder, &decision);
                in_flight.record_mut().response_size = Some(hit.body.len() as u64);
                return Ok(builder.body(hit.body));
            }
        }

        // Circuit breaker gate.
        if route.circuit_breaker_enabled {
            let permit = self.breakers.check(&route.service_name).await?;
            in_flight.permit = Some(permit);
        }

        // Forward, with load balancing and retries inside the deadline.
        self.forward(req, body, &route, context, in_flight, &decision, cache_key)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
        route: &Route,
        context: &RequestContext,
        in_flight: &mut InFlightRequest,
        decision: &RateLimitDecision,
        mut cache_key: Option<String>,
    ) -> Result<HttpResponse, GatewayError> {
        let method = req.method().clone();
        let reqwest_method = parse_method(&method);
        let headers = self.build_upstream_headers(req, context);
        let timeout_seconds = if route.timeout_seconds > 0 {
            route.timeout_seconds
        } else {
            self.config.gateway_request_timeout
        };
        let deadline = context.started + Duration::from_secs(timeout_seconds);

        let idempotent = matches!(method, ActixMethod::GET | ActixMethod::HEAD);
        let is_probe = in_flight
            .permit
            .as_ref()
            .map(|p| p.kind == PermitKind::Probe)
            .unwrap_or(false);
        // The half-open probe is a single shot by definition; everything
        // else is capped by the global retry budget.
        let max_attempts = if idempotent && !is_probe {
            route.retry_count.min(self.config.gateway_max_retry_count) + 1
        } else {
            1
        };

        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..max_attempts {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                self.report_failure(in_flight).await;
                return Err(GatewayError::UpstreamTimeout {
                    timeout: timeout_seconds,
                });
            };

            if attempt > 0 {
                let backoff = backoff_delay(attempt);
                if backoff >= remaining {
                    break;
                }
                tokio::time::sleep(backoff).await;
                warn!(
                    "Retry attempt {attempt} for {} {} [{}]",
                    method,
                    req.path(),
                    context.request_id
                );
            }

            // Pick a healthy instance fresh for every attempt.
            let healthy = self.store.healthy_instances(&route.service_name).await;
            let Some((instance, _guard)) = self.balancer.pick(
                &route.service_name,
                route.load_balance_strategy,
                &healthy,
            ) else {
                // No instance is not an upstream failure; hand back a
                // probe permit untouched.
                if let Some(permit) = in_flight.permit.take() {
                    self.breakers.release_cancelled_sync(&permit);
                }
                return Err(GatewayError::NoInstance {
                    service: route.service_name.clone(),
                });
            };

            let target_url =
                build_target_url(&instance.base_url(), req.path(), Some(req.query_string()));
            debug!(
                "Forwarding to {target_url} [{}] attempt {attempt}",
                context.request_id
            );

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                self.report_failure(in_flight).await;
                return Err(GatewayError::UpstreamTimeout {
                    timeout: timeout_seconds,
                });
            };

            let upstream = self
                .client
                .request(reqwest_method.clone(), &target_url)
                .timeout(remaining)
                .headers(headers.clone())
                .body(body.to_vec())
                .send()
                .await;

            match upstream {
                Ok(response) if response.status().as_u16() < 500 => {
                    self.report_success(in_flight).await;
                    return self
                        .deliver(response, route, in_flight, decision, cache_key.take())
                        .await;
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    self.report_failure(in_flight).await;
                    last_error = Some(GatewayError::Upstream {
                        service: route.service_name.clone(),
                        message: format!("upstream returned {status}"),
                        status: Some(status),
                    });
                    if is_probe {
                        break;
                    }
                }
                Err(e) if e.is_timeout() => {
                    self.report_failure(in_flight).await;
                    return Err(GatewayError::UpstreamTimeout {
                        timeout: timeout_seconds,
                    });
                }
                Err(e) => {
                    self.report_failure(in_flight).await;
                    last_error = Some(GatewayError::Upstream {
                        service: route.service_name.clone(),
                        message: e.to_string(),
                        status: None,
                    });
                    if is_probe {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::Upstream {
            service: route.service_name.clone(),
            message: "all retry attempts exhausted".to_string(),
            status: None,
        }))
    }

    /// Converts the upstream response for the client, buffering small or
    /// cacheable bodies and streaming large ones.
    async fn deliver(
        &self,
        response: reqwest::Response,
        route: &Route,
        in_flight: &mut InFlightRequest,
        decision: &RateLimitDecision,
        cache_key: Option<String>,
    ) -> Result<HttpResponse, GatewayError> {
        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = HttpResponse::build(status);

        let mut replay_headers = Vec::new();
        for (name, value) in response.headers() {
            let lower = name.as_str().to_lowercase();
            // The body is re-framed on the way out, so the upstream
            // Content-Length must not be echoed.
            if HOP_BY_HOP.contains(&lower.as_str()) || lower == "content-length" {
                continue;
            }
            if let Ok(header_value) =
                actix_web::http::header::HeaderValue::from_bytes(value.as_bytes())
            {
                builder.insert_header((name.as_str(), header_value));
            }
            if let Ok(text) = value.to_str() {
                replay_headers.push((name.as_str().to_string(), text.to_string()));
            }
        }
        rate_limit_headers(&mut builder, decision);

        let content_length = response.content_length();
        let buffer = cache_key.is_some()
            || content_length
                .map(|len| len <= STREAM_THRESHOLD_BYTES)
                .unwrap_or(false);

        if buffer {
            let bytes = response.bytes().await.map_err(|e| GatewayError::Upstream {
                service: route.service_name.clone(),
                message: e.to_string(),
                status: None,
            })?;
            in_flight.record_mut().response_size = Some(bytes.len() as u64);

            if let Some(key) = cache_key {
                let ttl = if route.cache_ttl_seconds > 0 {
                    route.cache_ttl_seconds
                } else {
                    self.config.response_cache_default_ttl
                };
                self.response_cache
                    .store(&key, status.as_u16(), &replay_headers, &bytes, ttl)
                    .await;
            }
            Ok(builder.body(bytes))
        } else {
            // Large or unknown-length payloads are streamed; the logged
            // size falls back to the upstream Content-Length.
            in_flight.record_mut().response_size = content_length;
            Ok(builder.streaming(response.bytes_stream()))
        }
    }

    async fn report_success(&self, in_flight: &mut InFlightRequest) {
        if let Some(permit) = in_flight.permit.take() {
            self.breakers.record_success(&permit).await;
        }
    }

    async fn report_failure(&self, in_flight: &mut InFlightRequest) {
        // Failures are counted per attempt; the permit stays in place
        // until the request resolves so retries keep reporting.
        if let Some(permit) = in_flight.permit.clone() {
            self.breakers.record_failure(&permit).await;
            if permit.kind == PermitKind::Probe {
                // A failed probe reopened the circuit; stop reporting.
                in_flight.permit = None;
            }
        }
    }

    fn build_upstream_headers(
        &self,
        req: &HttpRequest,
        context: &RequestContext,
    ) -> ReqwestHeaderMap {
        let mut headers = ReqwestHeaderMap::with_capacity(req.headers().len() + 2);

        for (key, value) in req.headers() {
            let lower = key.as_str().to_lowercase();
            // reqwest sets Content-Length from the forwarded body.
            if HOP_BY_HOP.contains(&lower.as_str()) || lower == "content-length" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_ref()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.insert(name, value);
            }
        }

        if let Ok(value) = HeaderValue::from_str(&context.request_id) {
            headers.insert(HeaderName::from_static("x-request-id"), value);
        }
        if let Some(peer) = req.connection_info().realip_remote_addr() {
            if let Ok(value) = HeaderValue::from_str(peer) {
                headers.append(HeaderName::from_static("x-forwarded-for"), value);
            }
        }
        headers
            .entry("user-agent")
            .or_insert_with(|| HeaderValue::from_static(concat!("opsgate/", env!("CARGO_PKG_VERSION"))));

        headers
    }
}

/// Adds the admission headers every forwarded response carries.
fn rate_limit_headers(
    builder: &mut actix_web::HttpResponseBuilder,
    decision: &RateLimitDecision,
) {
    builder.insert_header(("X-RateLimit-Limit", decision.limit.to_string()));
    builder.insert_header(("X-RateLimit-Remaining", decision.remaining().to_string()));
    builder.insert_header((
        "X-RateLimit-Reset",
        (Utc::now().timestamp() + decision.window_seconds as i64).to_string(),
    ));
}

fn bearer_token(req: &HttpRequest) -> Option<String> {
    let header = req.headers().get("authorization")?.to_str().ok()?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn header_str(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn parse_method(method: &ActixMethod) -> ReqwestMethod {
    match *method {
        ActixMethod::GET => ReqwestMethod::GET,
        ActixMethod::POST => ReqwestMethod::POST,
        ActixMethod::PUT => ReqwestMethod::PUT,
        ActixMethod::DELETE => ReqwestMethod::DELETE,
        ActixMethod::HEAD => ReqwestMethod::HEAD,
        ActixMethod::OPTIONS => ReqwestMethod::OPTIONS,
        ActixMethod::PATCH => ReqwestMethod::PATCH,
        _ => ReqwestMethod::GET,
    }
}

/// Exponential backoff: 100ms doubling per attempt, capped at 2s. The
/// caller additionally bounds it by the remaining deadline budget.
fn backoff_delay(attempt: u32) -> Duration {
    let ms = 100u64.saturating_mul(1 << attempt.min(6));
    Duration::from_millis(ms.min(2000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(2), Duration::from_millis(400));
        assert_eq!(backoff_delay(10), Duration::from_millis(2000));
    }

    #[test]
    fn hop_by_hop_covers_the_rfc_set() {
        for header in ["connection", "upgrade", "transfer-encoding", "host"] {
            assert!(HOP_BY_HOP.contains(&header));
        }
        assert!(!HOP_BY_HOP.contains(&"authorization"));
        assert!(!HOP_BY_HOP.contains(&"content-type"));
    }
}
