//! Prometheus metrics for the gateway.
//!
//! All collectors live in a registry owned by [`GatewayMetrics`], which is
//! created once at startup and shared through the application state.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Latency buckets in seconds, sized for LLM generations.
const LATENCY_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metrics registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics output is not valid UTF-8")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Counters, gauges and histograms recorded by the request pipeline.
pub struct GatewayMetrics {
    registry: Registry,
    /// Requests by endpoint and final status code.
    pub requests_total: IntCounterVec,
    /// Requests currently holding a slot.
    pub active_requests: IntGauge,
    /// Requests waiting in the admission queue.
    pub queue_depth: IntGauge,
    /// End-to-end latency by endpoint.
    pub request_latency: HistogramVec,
    /// 1 when the last health probe reached the backend with models loaded.
    pub backend_up: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("api_requests_total", "Total API requests"),
            &["endpoint", "status"],
        )?;
        let active_requests =
            IntGauge::new("api_active_requests", "Number of active GPU requests")?;
        let queue_depth = IntGauge::new(
            "api_queue_depth",
            "Number of queued requests waiting for GPU",
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "api_request_latency_seconds",
                "End-to-end request latency (seconds)",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["endpoint"],
        )?;
        let backend_up = IntGauge::new(
            "api_backend_up",
            "Whether the last health probe found the backend serving models",
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(backend_up.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            active_requests,
            queue_depth,
            request_latency,
            backend_up,
        })
    }

    /// Count a finished request.
    pub fn record_request(&self, endpoint: &str, status: &str) {
        self.requests_total
            .with_label_values(&[endpoint, status])
            .inc();
    }

    pub fn observe_latency(&self, endpoint: &str, seconds: f64) {
        self.request_latency
            .with_label_values(&[endpoint])
            .observe(seconds);
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Content type of [`GatewayMetrics::encode`] output.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}
