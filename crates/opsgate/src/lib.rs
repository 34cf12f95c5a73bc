//! # Opsgate API Gateway
//!
//! The API gateway core of the DevOps Central platform, built with Rust
//! and Actix Web. Opsgate sits in front of the platform's services and
//! runs every client request through a single pipeline: request
//! correlation, route matching, JWT validation with a revocation set,
//! permission checks, sliding-window rate limiting, per-service circuit
//! breaking, load-balanced upstream selection, and reliable forwarding
//! with bounded retries.
//!
//! ## Request pipeline
//!
//! ```text
//! Client
//!   │  request id / CORS preflight
//!   ▼
//! Route match ──► Auth ──► Permissions ──► Rate limit
//!                                              │
//!   Response cache ◄── Forward ◄── Balance ◄── Circuit gate
//!   │
//!   ▼
//! Response headers + async call log
//! ```
//!
//! ## Module organization
//!
//! - [`cache`] - Redis-compatible shared cache (rate-limit windows,
//!   revocation set, token/user/session and response caches)
//! - [`config`] - environment-driven configuration
//! - [`models`] - records, admin request types, error taxonomy, envelope
//! - [`store`] - route/instance/circuit/permission tables with JSON
//!   write-through persistence
//! - [`services`] - pipeline stages and background tasks
//! - [`routes`] - HTTP surface (ingress, health, metrics, admin, auth)
//! - [`middleware`] - request correlation, security and CORS headers
//! - [`utils`] - route matching and URL helpers
//! - [`logs`] - logger configuration
//!
//! ## Response envelope
//!
//! Every gateway-originated body uses `{code, msg, content}` with the
//! platform's stable business codes (`S10000` success, `F40400` route
//! not found, `F42900` rate limited, and so on). Upstream responses are
//! forwarded verbatim minus hop-by-hop headers.

pub mod cache;
pub mod config;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
pub mod utils;
