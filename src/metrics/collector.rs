// Gateway metrics collection
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Lock-free counters for cache, network and worker activity
#[derive(Debug)]
pub struct GatewayMetrics {
    // Requests
    requests_total: AtomicU64,
    request_errors: AtomicU64,
    rate_limited: AtomicU64,
    request_time_micros: AtomicU64,

    // Caches
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    result_hits: AtomicU64,
    result_misses: AtomicU64,

    // Upstream and workers
    network_fetches: AtomicU64,
    engine_invocations: AtomicU64,
    engine_timeouts: AtomicU64,

    start_time: SystemTime,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub requests_total: u64,
    pub request_errors: u64,
    pub rate_limited: u64,
    pub avg_request_time_ms: f64,
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub result_hits: u64,
    pub result_misses: u64,
    pub network_fetches: u64,
    pub engine_invocations: u64,
    pub engine_timeouts: u64,
}

impl MetricsSnapshot {
    /// Fraction of result lookups answered from cache
    pub fn result_hit_rate(&self) -> f64 {
        let total = self.result_hits + self.result_misses;
        if total == 0 {
            0.0
        } else {
            self.result_hits as f64 / total as f64
        }
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            request_errors: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            request_time_micros: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            memory_misses: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            disk_misses: AtomicU64::new(0),
            result_hits: AtomicU64::new(0),
            result_misses: AtomicU64::new(0),
            network_fetches: AtomicU64::new(0),
            engine_invocations: AtomicU64::new(0),
            engine_timeouts: AtomicU64::new(0),
            start_time: SystemTime::now(),
        }
    }

    /// Record a handled request and how long it took
    pub fn record_request(&self, elapsed: Duration, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.request_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if !success {
            self.request_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_hit(&self) {
        self.memory_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_miss(&self) {
        self.memory_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_hit(&self) {
        self.disk_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disk_miss(&self) {
        self.disk_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_hit(&self) {
        self.result_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_miss(&self) {
        self.result_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_fetch(&self) {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engine_invocation(&self) {
        self.engine_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_engine_timeout(&self) {
        self.engine_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self.requests_total.load(Ordering::Relaxed);
        let request_time_micros = self.request_time_micros.load(Ordering::Relaxed);
        let avg_request_time_ms = if requests_total > 0 {
            request_time_micros as f64 / requests_total as f64 / 1000.0
        } else {
            0.0
        };

        MetricsSnapshot {
            uptime_seconds: self.start_time.elapsed().unwrap_or_default().as_secs(),
            requests_total,
            request_errors: self.request_errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            avg_request_time_ms,
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            disk_misses: self.disk_misses.load(Ordering::Relaxed),
            result_hits: self.result_hits.load(Ordering::Relaxed),
            result_misses: self.result_misses.load(Ordering::Relaxed),
            network_fetches: self.network_fetches.load(Ordering::Relaxed),
            engine_invocations: self.engine_invocations.load(Ordering::Relaxed),
            engine_timeouts: self.engine_timeouts.load(Ordering::Relaxed),
        }
    }

    /// Render all counters in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let mut push = |name: &str, kind: &str, help: &str, value: String| {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} {}\n", name, kind));
            out.push_str(&format!("{} {}\n", name, value));
        };

        push("ytcipher_uptime_seconds", "counter", "Uptime in seconds", s.uptime_seconds.to_string());
        push("ytcipher_requests_total", "counter", "Requests handled", s.requests_total.to_string());
        push("ytcipher_request_errors_total", "counter", "Requests that failed", s.request_errors.to_string());
        push("ytcipher_rate_limited_total", "counter", "Requests rejected by the rate limiter", s.rate_limited.to_string());
        push("ytcipher_request_time_ms", "gauge", "Average request handling time", format!("{:.3}", s.avg_request_time_ms));
        push("ytcipher_memory_cache_hits_total", "counter", "Script content memory cache hits", s.memory_hits.to_string());
        push("ytcipher_memory_cache_misses_total", "counter", "Script content memory cache misses", s.memory_misses.to_string());
        push("ytcipher_disk_cache_hits_total", "counter", "Player script disk cache hits", s.disk_hits.to_string());
        push("ytcipher_disk_cache_misses_total", "counter", "Player script disk cache misses", s.disk_misses.to_string());
        push("ytcipher_result_cache_hits_total", "counter", "Signature and timestamp result cache hits", s.result_hits.to_string());
        push("ytcipher_result_cache_misses_total", "counter", "Signature and timestamp result cache misses", s.result_misses.to_string());
        push("ytcipher_network_fetches_total", "counter", "Player scripts fetched from upstream", s.network_fetches.to_string());
        push("ytcipher_engine_invocations_total", "counter", "Tasks submitted to the solving engine", s.engine_invocations.to_string());
        push("ytcipher_engine_timeouts_total", "counter", "Solving tasks that timed out", s.engine_timeouts.to_string());

        out
    }
}
