//! Opsgate API Gateway Server
//!
//! Server entry point: loads configuration from the environment, wires
//! the gateway components together, spawns the background tasks (health
//! loop, route-index refresher, call-log writer), and runs the HTTP
//! server with graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use log::{error, info};
use tokio::signal;

use opsgate::cache::SharedCache;
use opsgate::config::GatewayConfig;
use opsgate::logs::logger::configure_logger;
use opsgate::middleware::cors::Cors;
use opsgate::middleware::request_id::RequestId;
use opsgate::middleware::security::security_headers;
use opsgate::routes::{admin, auth, gateway, health, metrics};
use opsgate::services::call_logger::CallLogger;
use opsgate::services::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use opsgate::services::load_balancer::LoadBalancer;
use opsgate::services::permissions::PermissionChecker;
use opsgate::services::proxy::ProxyEngine;
use opsgate::services::rate_limiter::RateLimiter;
use opsgate::services::registry::{HealthCheckConfig, ServiceRegistry};
use opsgate::services::response_cache::ResponseCache;
use opsgate::services::token_validator::TokenValidator;
use opsgate::store::RouteStore;
use opsgate::utils::route_matcher::RouteIndexHandle;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    configure_logger();

    let config = GatewayConfig::from_env();
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {e}");
        std::process::exit(1);
    }
    info!("Starting Opsgate API Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Shared cache: Redis when configured, in-process otherwise.
    let cache = match &config.redis_url {
        Some(url) => match SharedCache::connect_redis(url).await {
            Ok(cache) => {
                info!("Connected to Redis cache");
                cache
            }
            Err(e) => {
                error!("Failed to connect to Redis: {e}");
                std::process::exit(1);
            }
        },
        None => {
            info!("REDIS_URL not set, using in-process cache");
            SharedCache::memory()
        }
    };

    let store = match RouteStore::open(&config.state_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open gateway state: {e}");
            std::process::exit(1);
        }
    };

    // Route index with change-driven and timed rebuilds.
    let index = Arc::new(RouteIndexHandle::empty());
    let _index_task = store.spawn_index_refresher(
        index.clone(),
        Duration::from_secs(config.route_index_refresh_seconds),
    );

    // Registry with the health loop.
    let registry = Arc::new(ServiceRegistry::new(
        store.clone(),
        HealthCheckConfig {
            base_interval: Duration::from_secs(config.health_check_interval),
            probe_timeout: config.health_check_timeout_duration(),
            unhealthy_threshold: config.unhealthy_threshold,
        },
    ));
    let _health_task = registry.clone().spawn_health_loop();

    // Asynchronous call logging.
    let call_logger = CallLogger::new(Some(PathBuf::from(&config.call_log_path)), 10_000);
    let _log_task = call_logger.clone().spawn_writer();

    let validator = Arc::new(
        TokenValidator::new(
            cache.clone(),
            &config.jwt_secret_key,
            config.token_cache_ttl,
            config.user_cache_ttl,
        )
        .with_session_ttl(config.session_cache_ttl),
    );
    let permissions = Arc::new(PermissionChecker::new(store.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(cache.clone()));
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_threshold,
            timeout_seconds: config.circuit_breaker_timeout,
        },
        store.clone(),
    ));
    let balancer = Arc::new(LoadBalancer::new());
    let response_cache = Arc::new(ResponseCache::new(
        cache.clone(),
        config.response_cache_max_body_bytes,
    ));
    let metrics_collector = metrics::MetricsCollector::default();

    let engine = Arc::new(ProxyEngine::new(
        config.clone(),
        index.clone(),
        store.clone(),
        validator.clone(),
        permissions,
        rate_limiter,
        breakers,
        balancer,
        response_cache,
        call_logger.clone(),
        metrics_collector.clone(),
    ));

    // Coarse ingress flood protection in front of the per-route
    // sliding-window limiter.
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(100)
        .burst_size(200)
        .finish()
        .expect("governor configuration is static");

    let bind_host = config.host.clone();
    let bind_port = config.port;
    info!("Listening on {bind_host}:{bind_port}");

    let app_config = config.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(metrics_collector.clone()))
            .app_data(web::Data::new(cache.clone()))
            .app_data(web::Data::new(app_config.clone()))
            .app_data(web::Data::from(store.clone()))
            .app_data(web::Data::from(validator.clone()))
            .app_data(web::Data::from(registry.clone()))
            .app_data(web::Data::from(index.clone()))
            .app_data(web::Data::from(engine.clone()))
            .app_data(
                web::JsonConfig::default()
                    .limit(1024 * 1024)
                    .error_handler(admin::json_error_handler),
            )
            .wrap(Governor::new(&governor_conf))
            .wrap(actix_web::middleware::Compress::default())
            .wrap(security_headers())
            .wrap(Cors::new(app_config.clone()))
            .wrap(RequestId)
            .configure(health::configure_health)
            .configure(metrics::configure_metrics)
            .configure(auth::configure_auth)
            .configure(admin::configure_admin)
            .configure(gateway::configure_gateway)
    })
    .bind((bind_host.as_str(), bind_port))?
    .run();

    info!("Server started");

    tokio::select! {
        result = server => {
            match result {
                Ok(_) => info!("Server stopped gracefully"),
                Err(e) => error!("Server error: {e}"),
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server");
        }
    }

    Ok(())
}
