//! Business logic: the pipeline stages and their background tasks.

pub mod call_logger;
pub mod circuit_breaker;
pub mod load_balancer;
pub mod permissions;
pub mod proxy;
pub mod rate_limiter;
pub mod registry;
pub mod response_cache;
pub mod token_validator;
