/// Observability hooks and the Prometheus-backed implementation
use anyhow::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::time::Duration;

/// Hooks invoked by the gateway at the decision points of a request.
///
/// All hooks have empty default bodies so implementors only override
/// what they care about. Hooks are called on the request path and must
/// not block.
pub trait Observer: Send + Sync {
    /// A route matched the request
    fn on_route_matched(&self, route_id: &str) {
        let _ = route_id;
    }

    /// No route matched the request
    fn on_unmatched(&self, method: &str, path: &str) {
        let _ = (method, path);
    }

    /// The rate limiter admitted or rejected a request
    fn on_rate_limit(&self, route_id: &str, key: &str, allowed: bool) {
        let _ = (route_id, key, allowed);
    }

    /// A filter or the chain failed with an error
    fn on_chain_error(&self, route_id: &str) {
        let _ = route_id;
    }

    /// A response is about to be returned to the client
    fn on_response(&self, status: u16, duration: Duration) {
        let _ = (status, duration);
    }
}

/// Observer that records nothing
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Prometheus-backed observer
pub struct MetricsObserver {
    /// Prometheus registry
    registry: Registry,

    // Request metrics
    /// Total number of requests
    requests_total: IntCounter,
    /// Requests that matched no route
    unmatched_total: IntCounter,
    /// Request duration histogram
    request_duration: Histogram,
    /// 4xx responses
    responses_4xx: IntCounter,
    /// 5xx responses
    responses_5xx: IntCounter,

    // Rate limiter metrics
    /// Requests admitted by the rate limiter
    rate_limit_allowed_total: IntCounter,
    /// Requests rejected by the rate limiter
    rate_limit_denied_total: IntCounter,

    // Error metrics
    /// Filter chain failures
    chain_errors_total: IntCounter,
}

impl MetricsObserver {
    /// Create a new observer with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        // Request metrics
        let requests_total = IntCounter::with_opts(Opts::new(
            "gateway_requests_total",
            "Total number of HTTP requests processed by the gateway",
        ))?;
        registry.register(Box::new(requests_total.clone()))?;

        let unmatched_total = IntCounter::with_opts(Opts::new(
            "gateway_unmatched_requests_total",
            "Total number of requests that matched no route",
        ))?;
        registry.register(Box::new(unmatched_total.clone()))?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let responses_4xx = IntCounter::with_opts(Opts::new(
            "gateway_responses_4xx_total",
            "Total number of 4xx responses",
        ))?;
        registry.register(Box::new(responses_4xx.clone()))?;

        let responses_5xx = IntCounter::with_opts(Opts::new(
            "gateway_responses_5xx_total",
            "Total number of 5xx responses",
        ))?;
        registry.register(Box::new(responses_5xx.clone()))?;

        // Rate limiter metrics
        let rate_limit_allowed_total = IntCounter::with_opts(Opts::new(
            "gateway_rate_limit_allowed_total",
            "Total number of requests admitted by the rate limiter",
        ))?;
        registry.register(Box::new(rate_limit_allowed_total.clone()))?;

        let rate_limit_denied_total = IntCounter::with_opts(Opts::new(
            "gateway_rate_limit_denied_total",
            "Total number of requests rejected by the rate limiter",
        ))?;
        registry.register(Box::new(rate_limit_denied_total.clone()))?;

        // Error metrics
        let chain_errors_total = IntCounter::with_opts(Opts::new(
            "gateway_chain_errors_total",
            "Total number of filter chain failures",
        ))?;
        registry.register(Box::new(chain_errors_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            unmatched_total,
            request_duration,
            responses_4xx,
            responses_5xx,
            rate_limit_allowed_total,
            rate_limit_denied_total,
            chain_errors_total,
        })
    }

    /// Get the metrics registry for Prometheus exposition
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Observer for MetricsObserver {
    fn on_route_matched(&self, _route_id: &str) {
        self.requests_total.inc();
    }

    fn on_unmatched(&self, _method: &str, _path: &str) {
        self.requests_total.inc();
        self.unmatched_total.inc();
    }

    fn on_rate_limit(&self, _route_id: &str, _key: &str, allowed: bool) {
        if allowed {
            self.rate_limit_allowed_total.inc();
        } else {
            self.rate_limit_denied_total.inc();
        }
    }

    fn on_chain_error(&self, _route_id: &str) {
        self.chain_errors_total.inc();
    }

    fn on_response(&self, status: u16, duration: Duration) {
        self.request_duration.observe(duration.as_secs_f64());
        match status {
            400..=499 => self.responses_4xx.inc(),
            500..=599 => self.responses_5xx.inc(),
            _ => {}
        }
    }
}
