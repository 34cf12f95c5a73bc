//! Route matching.
//!
//! Patterns are literal segments mixed with named parameters
//! (`/api/v1/users/:id`). At index build time each pattern is compiled
//! once: fully-literal patterns go into a hash map for O(1) lookup,
//! parameterized patterns become anchored regexes tried in ranked order.
//!
//! Ranking among matching active routes: highest priority first, then
//! pattern specificity (static before parameterized, more literal
//! segments first, fewer parameters first), then earliest insertion.
//! Matching an unchanged index is deterministic.
//!
//! The live index is held in an `ArcSwap` so request handlers read a
//! consistent snapshot without locking while rebuilds replace it
//! atomically.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::HashMap as AHashMap;
use arc_swap::ArcSwap;
use regex::Regex;
use thiserror::Error;

use crate::models::route::Route;

#[derive(Error, Debug, PartialEq)]
pub enum RouteMatchError {
    /// Malformed parameter syntax or an empty parameter name.
    #[error("invalid route pattern: {pattern}")]
    InvalidPattern { pattern: String },

    #[error("regex compilation failed: {0}")]
    RegexError(String),
}

/// A pattern compiled for repeated matching.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub route: Route,
    regex: Arc<Regex>,
    pub param_names: Vec<String>,
    literal_segments: usize,
}

/// Result of a successful match.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Route,
    /// Extracted path parameters in pattern order.
    pub path_params: HashMap<String, String>,
}

/// Immutable matching index built from the active route set.
#[derive(Debug, Default)]
pub struct RouteIndex {
    /// Fully-literal patterns, possibly several methods per pattern.
    static_routes: AHashMap<String, Vec<Route>>,
    /// Parameterized patterns in ranked order.
    dynamic_routes: Vec<CompiledRoute>,
}

/// Ranking key: priority desc, static first, more literals first, fewer
/// params first, earliest insertion first.
fn rank_key(route: &Route, is_static: bool, literals: usize, params: usize) -> (i32, u8, i64, usize, u64) {
    (
        -(route.priority as i32),
        u8::from(!is_static),
        -(literals as i64),
        params,
        route.seq,
    )
}

impl RouteIndex {
    /// Compiles the given routes. Routes with invalid patterns are
    /// skipped with an error entry in the returned list so one bad admin
    /// entry cannot take the whole index down.
    pub fn build(routes: Vec<Route>) -> (Self, Vec<RouteMatchError>) {
        let mut static_routes: AHashMap<String, Vec<Route>> = AHashMap::default();
        let mut dynamic_routes = Vec::with_capacity(routes.len());
        let mut errors = Vec::new();

        for route in routes {
            if route.path_pattern.contains(':') {
                match compile_route(route) {
                    Ok(compiled) => dynamic_routes.push(compiled),
                    Err(e) => errors.push(e),
                }
            } else {
                static_routes
                    .entry(route.path_pattern.clone())
                    .or_default()
                    .push(route);
            }
        }

        dynamic_routes.sort_by_key(|c| {
            rank_key(&c.route, false, c.literal_segments, c.param_names.len())
        });

        (
            Self {
                static_routes,
                dynamic_routes,
            },
            errors,
        )
    }

    /// Number of routes in the index.
    pub fn len(&self) -> usize {
        self.static_routes.values().map(Vec::len).sum::<usize>() + self.dynamic_routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the best-ranked active route admitting `method` whose
    /// pattern matches `path`, with extracted path parameters.
    pub fn find_match(&self, method: &str, path: &str) -> Option<RouteMatch> {
        let mut best: Option<(RouteMatch, (i32, u8, i64, usize, u64))> = None;

        if let Some(candidates) = self.static_routes.get(path) {
            for route in candidates {
                if !route.method.admits(method) {
                    continue;
                }
                let literals = route.path_pattern.split('/').filter(|s| !s.is_empty()).count();
                let key = rank_key(route, true, literals, 0);
                if best.as_ref().map(|(_, k)| key < *k).unwrap_or(true) {
                    best = Some((
                        RouteMatch {
                            route: route.clone(),
                            path_params: HashMap::new(),
                        },
                        key,
                    ));
                }
            }
        }

        for compiled in &self.dynamic_routes {
            if !compiled.route.method.admits(method) {
                continue;
            }
            let Some(captures) = compiled.regex.captures(path) else {
                continue;
            };
            let key = rank_key(
                &compiled.route,
                false,
                compiled.literal_segments,
                compiled.param_names.len(),
            );
            if best.as_ref().map(|(_, k)| key < *k).unwrap_or(true) {
                let mut path_params = HashMap::with_capacity(compiled.param_names.len());
                for (i, name) in compiled.param_names.iter().enumerate() {
                    if let Some(value) = captures.get(i + 1) {
                        path_params.insert(name.clone(), value.as_str().to_string());
                    }
                }
                best = Some((
                    RouteMatch {
                        route: compiled.route.clone(),
                        path_params,
                    },
                    key,
                ));
            }
        }

        best.map(|(m, _)| m)
    }
}

/// Compiles a `:param` pattern into an anchored regex and records its
/// parameter names and literal segment count.
fn compile_route(route: Route) -> Result<CompiledRoute, RouteMatchError> {
    let pattern = route.path_pattern.clone();
    let mut regex_pattern = String::with_capacity(pattern.len() * 2);
    regex_pattern.push('^');

    let mut param_names = Vec::new();
    let mut literal_segments = 0;

    for segment in pattern.split('/').skip(1) {
        regex_pattern.push('/');
        if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(RouteMatchError::InvalidPattern {
                    pattern: pattern.clone(),
                });
            }
            param_names.push(name.to_string());
            regex_pattern.push_str("([^/]+)");
        } else {
            if segment.contains(':') {
                return Err(RouteMatchError::InvalidPattern {
                    pattern: pattern.clone(),
                });
            }
            literal_segments += 1;
            regex_pattern.push_str(&regex::escape(segment));
        }
    }
    regex_pattern.push('$');

    let regex =
        Regex::new(&regex_pattern).map_err(|e| RouteMatchError::RegexError(e.to_string()))?;

    Ok(CompiledRoute {
        route,
        regex: Arc::new(regex),
        param_names,
        literal_segments,
    })
}

/// Shared handle to the live index. Reads are wait-free snapshots;
/// the rebuild task replaces the whole index atomically.
pub struct RouteIndexHandle {
    index: ArcSwap<RouteIndex>,
}

impl RouteIndexHandle {
    pub fn new(index: RouteIndex) -> Self {
        Self {
            index: ArcSwap::from_pointee(index),
        }
    }

    pub fn empty() -> Self {
        Self::new(RouteIndex::default())
    }

    pub fn snapshot(&self) -> Arc<RouteIndex> {
        self.index.load_full()
    }

    pub fn replace(&self, index: RouteIndex) {
        self.index.store(Arc::new(index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::{RecordStatus, RouteMethod};
    use chrono::Utc;

    fn route(pattern: &str, method: RouteMethod, priority: u8, seq: u64) -> Route {
        Route {
            id: format!("r{seq}"),
            service_name: "user_service".to_string(),
            path_pattern: pattern.to_string(),
            method,
            version: "v1".to_string(),
            is_active: true,
            requires_auth: false,
            required_permissions: vec![],
            permission_check_strategy: Default::default(),
            rate_limit_rpm: 1000,
            timeout_seconds: 30,
            retry_count: 0,
            circuit_breaker_enabled: true,
            cache_enabled: false,
            cache_ttl_seconds: 300,
            load_balance_strategy: Default::default(),
            priority,
            seq,
            status: RecordStatus::Active,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn static_match_beats_dynamic_at_equal_priority() {
        let (index, errors) = RouteIndex::build(vec![
            route("/api/v1/users/:id", RouteMethod::Get, 0, 0),
            route("/api/v1/users/profile", RouteMethod::Get, 0, 1),
        ]);
        assert!(errors.is_empty());

        let m = index.find_match("GET", "/api/v1/users/profile").unwrap();
        assert_eq!(m.route.path_pattern, "/api/v1/users/profile");

        let m = index.find_match("GET", "/api/v1/users/42").unwrap();
        assert_eq!(m.route.path_pattern, "/api/v1/users/:id");
        assert_eq!(m.path_params["id"], "42");
    }

    #[test]
    fn higher_priority_wins_regardless_of_specificity() {
        let (index, _) = RouteIndex::build(vec![
            route("/api/v1/users/profile", RouteMethod::Get, 0, 0),
            route("/api/v1/users/:id", RouteMethod::Get, 10, 1),
        ]);

        let m = index.find_match("GET", "/api/v1/users/profile").unwrap();
        assert_eq!(m.route.path_pattern, "/api/v1/users/:id");
    }

    #[test]
    fn priority_ties_break_by_insertion_order() {
        let (index, _) = RouteIndex::build(vec![
            route("/api/v1/orders/:id", RouteMethod::Get, 5, 7),
            route("/api/v1/orders/:order", RouteMethod::Get, 5, 3),
        ]);

        let m = index.find_match("GET", "/api/v1/orders/9").unwrap();
        assert_eq!(m.route.seq, 3);
    }

    #[test]
    fn any_method_routes_admit_every_method() {
        let (index, _) = RouteIndex::build(vec![route(
            "/api/v1/ping",
            RouteMethod::Any,
            0,
            0,
        )]);
        assert!(index.find_match("GET", "/api/v1/ping").is_some());
        assert!(index.find_match("DELETE", "/api/v1/ping").is_some());
    }

    #[test]
    fn method_mismatch_is_no_match() {
        let (index, _) = RouteIndex::build(vec![route(
            "/api/v1/users",
            RouteMethod::Get,
            0,
            0,
        )]);
        assert!(index.find_match("POST", "/api/v1/users").is_none());
        assert!(index.find_match("GET", "/api/v1/unknown").is_none());
    }

    #[test]
    fn multiple_parameters_extract_in_order() {
        let (index, _) = RouteIndex::build(vec![route(
            "/api/v1/users/:user_id/posts/:post_id",
            RouteMethod::Get,
            0,
            0,
        )]);
        let m = index
            .find_match("GET", "/api/v1/users/7/posts/99")
            .unwrap();
        assert_eq!(m.path_params["user_id"], "7");
        assert_eq!(m.path_params["post_id"], "99");
    }

    #[test]
    fn invalid_parameter_names_are_reported() {
        let (index, errors) = RouteIndex::build(vec![
            route("/api/v1/users/:", RouteMethod::Get, 0, 0),
            route("/api/v1/ok", RouteMethod::Get, 0, 1),
        ]);
        assert_eq!(errors.len(), 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn matching_is_deterministic() {
        let routes = vec![
            route("/api/v1/users/:id", RouteMethod::Get, 2, 0),
            route("/api/v1/users/:uid", RouteMethod::Get, 2, 1),
            route("/api/v1/users/me", RouteMethod::Get, 2, 2),
        ];
        let (index, _) = RouteIndex::build(routes);
        let first = index.find_match("GET", "/api/v1/users/77").unwrap();
        for _ in 0..50 {
            let again = index.find_match("GET", "/api/v1/users/77").unwrap();
            assert_eq!(again.route.id, first.route.id);
        }
    }

    #[test]
    fn snapshot_replacement_is_visible_to_readers() {
        let handle = RouteIndexHandle::empty();
        assert!(handle.snapshot().is_empty());

        let (index, _) = RouteIndex::build(vec![route("/api/v1/users", RouteMethod::Get, 0, 0)]);
        handle.replace(index);
        assert_eq!(handle.snapshot().len(), 1);
    }
}
