//! Prometheus-style metrics collection and exposition.
//!
//! Atomic counters updated on the request hot path, rendered as text
//! exposition at `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::{web, HttpResponse, Result};

/// Thread-safe gateway metrics. Cheap to clone and share across
/// workers; all updates are lock-free.
#[derive(Clone)]
pub struct MetricsCollector {
    pub requests_total: Arc<AtomicU64>,
    pub requests_success: Arc<AtomicU64>,
    pub requests_error: Arc<AtomicU64>,
    pub response_time_sum_ms: Arc<AtomicU64>,
    pub active_connections: Arc<AtomicU64>,
    pub peak_connections: Arc<AtomicU64>,
    pub response_time_bucket_100ms: Arc<AtomicU64>,
    pub response_time_bucket_500ms: Arc<AtomicU64>,
    pub response_time_bucket_1s: Arc<AtomicU64>,
    pub response_time_bucket_5s: Arc<AtomicU64>,
    pub response_time_bucket_inf: Arc<AtomicU64>,
    pub http_4xx_errors: Arc<AtomicU64>,
    pub http_5xx_errors: Arc<AtomicU64>,
    pub rate_limited_total: Arc<AtomicU64>,
    pub circuit_open_total: Arc<AtomicU64>,
    pub response_cache_hits: Arc<AtomicU64>,
    pub upstream_timeouts: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            requests_success: Arc::new(AtomicU64::new(0)),
            requests_error: Arc::new(AtomicU64::new(0)),
            response_time_sum_ms: Arc::new(AtomicU64::new(0)),
            active_connections: Arc::new(AtomicU64::new(0)),
            peak_connections: Arc::new(AtomicU64::new(0)),
            response_time_bucket_100ms: Arc::new(AtomicU64::new(0)),
            response_time_bucket_500ms: Arc::new(AtomicU64::new(0)),
            response_time_bucket_1s: Arc::new(AtomicU64::new(0)),
            response_time_bucket_5s: Arc::new(AtomicU64::new(0)),
            response_time_bucket_inf: Arc::new(AtomicU64::new(0)),
            http_4xx_errors: Arc::new(AtomicU64::new(0)),
            http_5xx_errors: Arc::new(AtomicU64::new(0)),
            rate_limited_total: Arc::new(AtomicU64::new(0)),
            circuit_open_total: Arc::new(AtomicU64::new(0)),
            response_cache_hits: Arc::new(AtomicU64::new(0)),
            upstream_timeouts: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }
}

impl MetricsCollector {
    pub fn record_request(&self, status: u16, duration: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if status < 400 {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_error.fetch_add(1, Ordering::Relaxed);
            if status < 500 {
                self.http_4xx_errors.fetch_add(1, Ordering::Relaxed);
            } else {
                self.http_5xx_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        let ms = duration.as_millis() as u64;
        self.response_time_sum_ms.fetch_add(ms, Ordering::Relaxed);
        let bucket = if ms < 100 {
            &self.response_time_bucket_100ms
        } else if ms < 500 {
            &self.response_time_bucket_500ms
        } else if ms < 1000 {
            &self.response_time_bucket_1s
        } else if ms < 5000 {
            &self.response_time_bucket_5s
        } else {
            &self.response_time_bucket_inf
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_connections(&self) {
        let current = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_connections.fetch_max(current, Ordering::Relaxed);
    }

    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_open(&self) {
        self.circuit_open_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.response_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_timeout(&self) {
        self.upstream_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders the text exposition format.
    pub fn render(&self) -> String {
        let load = |c: &Arc<AtomicU64>| c.load(Ordering::Relaxed);
        let total = load(&self.requests_total);
        let sum_ms = load(&self.response_time_sum_ms);
        let avg_ms = if total > 0 { sum_ms / total } else { 0 };

        format!(
            concat!(
                "# HELP opsgate_requests_total Total requests processed\n",
                "# TYPE opsgate_requests_total counter\n",
                "opsgate_requests_total {}\n",
                "# HELP opsgate_requests_success Requests with status < 400\n",
                "# TYPE opsgate_requests_success counter\n",
                "opsgate_requests_success {}\n",
                "# HELP opsgate_requests_error Requests with status >= 400\n",
                "# TYPE opsgate_requests_error counter\n",
                "opsgate_requests_error {}\n",
                "# HELP opsgate_http_4xx_errors Client error responses\n",
                "# TYPE opsgate_http_4xx_errors counter\n",
                "opsgate_http_4xx_errors {}\n",
                "# HELP opsgate_http_5xx_errors Server error responses\n",
                "# TYPE opsgate_http_5xx_errors counter\n",
                "opsgate_http_5xx_errors {}\n",
                "# HELP opsgate_rate_limited_total Requests rejected by the rate limiter\n",
                "# TYPE opsgate_rate_limited_total counter\n",
                "opsgate_rate_limited_total {}\n",
                "# HELP opsgate_circuit_open_total Requests rejected by open circuits\n",
                "# TYPE opsgate_circuit_open_total counter\n",
                "opsgate_circuit_open_total {}\n",
                "# HELP opsgate_response_cache_hits Responses served from cache\n",
                "# TYPE opsgate_response_cache_hits counter\n",
                "opsgate_response_cache_hits {}\n",
                "# HELP opsgate_upstream_timeouts Upstream deadline expirations\n",
                "# TYPE opsgate_upstream_timeouts counter\n",
                "opsgate_upstream_timeouts {}\n",
                "# HELP opsgate_active_connections Currently in-flight requests\n",
                "# TYPE opsgate_active_connections gauge\n",
                "opsgate_active_connections {}\n",
                "# HELP opsgate_peak_connections Peak concurrent requests\n",
                "# TYPE opsgate_peak_connections gauge\n",
                "opsgate_peak_connections {}\n",
                "# HELP opsgate_response_time_avg_ms Average response time\n",
                "# TYPE opsgate_response_time_avg_ms gauge\n",
                "opsgate_response_time_avg_ms {}\n",
                "# HELP opsgate_response_time_ms Response time histogram\n",
                "# TYPE opsgate_response_time_ms histogram\n",
                "opsgate_response_time_ms_bucket{{le=\"100\"}} {}\n",
                "opsgate_response_time_ms_bucket{{le=\"500\"}} {}\n",
                "opsgate_response_time_ms_bucket{{le=\"1000\"}} {}\n",
                "opsgate_response_time_ms_bucket{{le=\"5000\"}} {}\n",
                "opsgate_response_time_ms_bucket{{le=\"+Inf\"}} {}\n",
                "# HELP opsgate_uptime_seconds Seconds since start\n",
                "# TYPE opsgate_uptime_seconds counter\n",
                "opsgate_uptime_seconds {}\n",
            ),
            total,
            load(&self.requests_success),
            load(&self.requests_error),
            load(&self.http_4xx_errors),
            load(&self.http_5xx_errors),
            load(&self.rate_limited_total),
            load(&self.circuit_open_total),
            load(&self.response_cache_hits),
            load(&self.upstream_timeouts),
            load(&self.active_connections),
            load(&self.peak_connections),
            avg_ms,
            load(&self.response_time_bucket_100ms),
            load(&self.response_time_bucket_500ms),
            load(&self.response_time_bucket_1s),
            load(&self.response_time_bucket_5s),
            load(&self.response_time_bucket_inf),
            self.start_time.elapsed().as_secs(),
        )
    }
}

pub async fn metrics_endpoint(metrics: web::Data<MetricsCollector>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(metrics.render()))
}

pub fn configure_metrics(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(metrics_endpoint));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_reflects_recorded_requests() {
        let metrics = MetricsCollector::default();
        metrics.record_request(200, Duration::from_millis(50));
        metrics.record_request(502, Duration::from_millis(700));
        metrics.record_rate_limited();

        let text = metrics.render();
        assert!(text.contains("opsgate_requests_total 2"));
        assert!(text.contains("opsgate_requests_success 1"));
        assert!(text.contains("opsgate_http_5xx_errors 1"));
        assert!(text.contains("opsgate_rate_limited_total 1"));
        assert!(text.contains("opsgate_response_time_ms_bucket{le=\"100\"} 1"));
    }

    #[test]
    fn peak_connections_track_the_high_water_mark() {
        let metrics = MetricsCollector::default();
        metrics.increment_connections();
        metrics.increment_connections();
        metrics.decrement_connections();
        metrics.increment_connections();

        assert_eq!(metrics.peak_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
    }
}
