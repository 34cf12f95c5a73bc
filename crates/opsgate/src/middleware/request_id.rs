//! Request correlation middleware.
//!
//! Honors an inbound `X-Request-ID`, otherwise assigns one, and makes it
//! available to handlers through request extensions. On the way out it
//! echoes the id, stamps `X-Response-Time`, and emits the start/finish
//! log lines operators grep for.

use std::future::{ready, Ready};
use std::rc::Rc;
use std::time::Instant;

use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::{Error, HttpMessage};
use futures_util::future::LocalBoxFuture;
use log::info;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Per-request correlation data, readable by any handler via
/// `HttpRequest::extensions`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub started: Instant,
}

pub struct RequestId;

impl<S, B> Transform<S, ServiceRequest> for RequestId
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: actix_web::body::MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequestIdMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestIdMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct RequestIdMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RequestIdMiddleware<S>
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

        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(|v| v.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let context = RequestContext {
            request_id: request_id.clone(),
            started: Instant::now(),
        };
        req.extensions_mut().insert(context.clone());

        info!(
            "Request started [{}]: {} {}",
            request_id,
            req.method(),
            req.path()
        );

        Box::pin(async move {
            let mut res = service.call(req).await?;

            let elapsed_ms = context.started.elapsed().as_millis();
            let headers = res.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                headers.insert(HeaderName::from_static("x-request-id"), value);
            }
            if let Ok(value) = HeaderValue::from_str(&format!("{elapsed_ms}ms")) {
                headers.insert(HeaderName::from_static("x-response-time"), value);
            }

            info!(
                "Request completed [{}]: {} ({}ms)",
                request_id,
                res.status().as_u16(),
                elapsed_ms
            );
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, web, App, HttpResponse};

    async fn ok_handler() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn assigns_a_request_id_when_absent() {
        let app = test::init_service(
            App::new()
                .wrap(RequestId)
                .route("/x", web::get().to(ok_handler)),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/x").to_request()).await;
        let id = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(!id.is_empty());
        assert!(resp.headers().contains_key("x-response-time"));
    }

    #[actix_web::test]
    async fn echoes_an_inbound_request_id() {
        let app = test::init_service(
            App::new()
                .wrap(RequestId)
                .route("/x", web::get().to(ok_handler)),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/x")
                .insert_header((REQUEST_ID_HEADER, "trace-123"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "trace-123");
    }
}
