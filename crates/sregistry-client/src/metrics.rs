//! Prometheus metrics monitoring
//!
//! Provides metrics collection for:
//! - Request latency (histogram)
//! - Failed/successful request count (counter)
//! - Endpoint failovers (counter)
//! - Missed heartbeats (counter)
//! - Cached service count (gauge)

use std::time::{Duration, Instant};

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics collector, backed by a registry owned by the client
pub struct MetricsMonitor {
    registry: Registry,

    /// Request latency histogram
    pub request_latency: HistogramVec,

    /// Failed request count counter
    pub failed_request_count: IntCounterVec,

    /// Success request count counter
    pub success_request_count: IntCounterVec,

    /// Switches to the next endpoint after a failure
    pub endpoint_failover_count: IntCounter,

    /// Missed heartbeats per service
    pub heartbeat_miss_count: IntCounterVec,

    /// Number of services held by the discovery cache
    pub cached_service_count: IntGauge,
}

impl MetricsMonitor {
    /// Create a new metrics monitor
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "sregistry_request_latency_seconds",
                "Request latency in seconds",
            ),
            &["operation", "status"],
        )?;

        let failed_request_count = IntCounterVec::new(
            Opts::new(
                "sregistry_failed_requests_total",
                "Total number of failed requests",
            ),
            &["operation", "error_type"],
        )?;

        let success_request_count = IntCounterVec::new(
            Opts::new(
                "sregistry_success_requests_total",
                "Total number of successful requests",
            ),
            &["operation"],
        )?;

        let endpoint_failover_count = IntCounter::new(
            "sregistry_endpoint_failovers_total",
            "Total number of switches to the next registry endpoint",
        )?;

        let heartbeat_miss_count = IntCounterVec::new(
            Opts::new(
                "sregistry_heartbeat_misses_total",
                "Total number of missed instance heartbeats",
            ),
            &["service"],
        )?;

        let cached_service_count = IntGauge::new(
            "sregistry_cached_services",
            "Number of services in the discovery cache",
        )?;

        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(failed_request_count.clone()))?;
        registry.register(Box::new(success_request_count.clone()))?;
        registry.register(Box::new(endpoint_failover_count.clone()))?;
        registry.register(Box::new(heartbeat_miss_count.clone()))?;
        registry.register(Box::new(cached_service_count.clone()))?;

        Ok(Self {
            registry,
            request_latency,
            failed_request_count,
            success_request_count,
            endpoint_failover_count,
            heartbeat_miss_count,
            cached_service_count,
        })
    }

    /// Record request latency
    pub fn record_latency(&self, operation: &str, status: &str, duration: Duration) {
        self.request_latency
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Increment failed request count
    pub fn increment_failed_request(&self, operation: &str, error_type: &str) {
        self.failed_request_count
            .with_label_values(&[operation, error_type])
            .inc();
    }

    /// Increment success request count
    pub fn increment_success_request(&self, operation: &str) {
        self.success_request_count
            .with_label_values(&[operation])
            .inc();
    }

    pub fn increment_endpoint_failover(&self) {
        self.endpoint_failover_count.inc();
    }

    pub fn increment_heartbeat_miss(&self, service: &str) {
        self.heartbeat_miss_count.with_label_values(&[service]).inc();
    }

    pub fn set_cached_services(&self, count: usize) {
        self.cached_service_count.set(count as i64);
    }

    /// The registry the metrics live in, for embedding into an exporter
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get metrics in Prometheus format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Simple metrics timer for measuring operation duration
pub struct Timer<'a> {
    metrics: &'a MetricsMonitor,
    operation: &'a str,
    start: Instant,
}

impl<'a> Timer<'a> {
    /// Create a new timer
    pub fn start(metrics: &'a MetricsMonitor, operation: &'a str) -> Self {
        Self {
            metrics,
            operation,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record success
    pub fn success(self) {
        let duration = self.start.elapsed();
        self.metrics
            .record_latency(self.operation, "success", duration);
        self.metrics.increment_success_request(self.operation);
    }

    /// Stop the timer and record failure
    pub fn failure(self, error_type: &str) {
        let duration = self.start.elapsed();
        self.metrics
            .record_latency(self.operation, "error", duration);
        self.metrics
            .increment_failed_request(self.operation, error_type);
    }
}
