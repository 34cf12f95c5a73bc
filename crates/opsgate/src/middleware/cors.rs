//! CORS headers for actual (non-preflight) responses.
//!
//! Preflights short-circuit inside the proxy engine; every other
//! response passes through here. The middleware reads the incoming
//! `Origin` header and echoes it back when the configured origin list
//! allows it, so a pinned multi-origin configuration works for every
//! configured origin. Requests from disallowed origins get no CORS
//! headers at all; clients without an `Origin` header only see the
//! wildcard when the configuration itself is wildcard.

use std::future::{ready, Ready};
use std::rc::Rc;

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::Error;
use futures_util::future::LocalBoxFuture;

use crate::config::GatewayConfig;

pub struct Cors {
    config: Rc<GatewayConfig>,
}

impl Cors {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config: Rc::new(config),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Cors
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = CorsMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CorsMiddleware {
            service: Rc::new(service),
            config: self.config.clone(),
        }))
    }
}

pub struct CorsMiddleware<S> {
    service: Rc<S>,
    config: Rc<GatewayConfig>,
}

impl<S, B> Service<ServiceRequest> for CorsMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let config = self.config.clone();

        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Box::pin(async move {
            let mut res = service.call(req).await?;

            let allow_origin = match &origin {
                Some(origin) if config.origin_allowed(origin) => Some(origin.clone()),
                Some(_) => None,
                None => config
                    .cors_origins
                    .iter()
                    .any(|o| o == "*")
                    .then(|| "*".to_string()),
            };

            if let Some(value) =
                allow_origin.and_then(|origin| HeaderValue::from_str(&origin).ok())
            {
                let headers = res.headers_mut();
                headers.insert(
                    HeaderName::from_static("access-control-allow-origin"),
                    value,
                );
                headers.insert(
                    HeaderName::from_static("access-control-allow-methods"),
                    HeaderValue::from_static("GET,POST,PUT,DELETE,PATCH,OPTIONS"),
                );
                headers.insert(
                    HeaderName::from_static("access-control-allow-headers"),
                    HeaderValue::from_static(
                        "Content-Type,Authorization,X-Request-ID,x-request-id",
                    ),
                );
                headers.insert(
                    HeaderName::from_static("access-control-allow-credentials"),
                    HeaderValue::from_static("true"),
                );
                headers.insert(
                    HeaderName::from_static("access-control-expose-headers"),
                    HeaderValue::from_static("X-Request-ID,X-Response-Time"),
                );
            }

            Ok(res)
        })
    }
}
