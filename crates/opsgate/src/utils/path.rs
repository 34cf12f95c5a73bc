//! URL assembly helpers for upstream forwarding.

/// Joins an instance base URL with the request path and query string.
///
/// The gateway forwards the external path verbatim; path rewriting is a
/// property of upstream services, not of the gateway.
///
/// ```
/// use opsgate::utils::path::build_target_url;
///
/// let url = build_target_url("http://10.0.0.3:8080", "/api/v1/users/42", Some("page=2"));
/// assert_eq!(url, "http://10.0.0.3:8080/api/v1/users/42?page=2");
///
/// let url = build_target_url("http://10.0.0.3:8080", "/health", None);
/// assert_eq!(url, "http://10.0.0.3:8080/health");
/// ```
pub fn build_target_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{base_url}{path}?{q}"),
        _ => format!("{base_url}{path}"),
    }
}

/// Canonical form of a query string used in response cache keys:
/// pairs sorted so parameter order does not fragment the cache.
pub fn sorted_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<&str> = query.split('&').collect();
    pairs.sort_unstable();
    pairs.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_query_is_order_independent() {
        assert_eq!(sorted_query("b=2&a=1"), sorted_query("a=1&b=2"));
        assert_eq!(sorted_query(""), "");
        assert_eq!(sorted_query("page=2&size=10"), "page=2&size=10");
    }
}
