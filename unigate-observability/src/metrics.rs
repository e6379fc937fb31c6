use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Metrics collector for the gateway.
///
/// Counters are per-replica; scrape each instance, nothing is coordinated
/// across replicas.
pub struct MetricsCollector {
    registry: Registry,

    /// Proxied requests by shard and status class
    pub proxy_requests_total: IntCounterVec,

    /// Upstream forwarding latency by shard
    pub upstream_latency: HistogramVec,

    /// Requests denied by the rate limiter
    pub rate_limited_total: IntCounterVec,

    /// Auth gate outcomes
    pub auth_failures_total: IntCounterVec,

    /// Payment sessions reaching a terminal state
    pub payment_sessions_total: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let proxy_requests_total = IntCounterVec::new(
            Opts::new("unigate_proxy_requests_total", "Proxied requests"),
            &["shard", "status"],
        )?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("unigate_upstream_latency_seconds", "Upstream response time")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            &["shard"],
        )?;

        let rate_limited_total = IntCounterVec::new(
            Opts::new("unigate_rate_limited_total", "Rate-limited requests"),
            &["api_key"],
        )?;

        let auth_failures_total = IntCounterVec::new(
            Opts::new("unigate_auth_failures_total", "Rejected credentials"),
            &["reason"],
        )?;

        let payment_sessions_total = IntCounterVec::new(
            Opts::new(
                "unigate_payment_sessions_total",
                "Payment sessions by terminal status",
            ),
            &["status"],
        )?;

        registry.register(Box::new(proxy_requests_total.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(auth_failures_total.clone()))?;
        registry.register(Box::new(payment_sessions_total.clone()))?;

        Ok(Self {
            registry,
            proxy_requests_total,
            upstream_latency,
            rate_limited_total,
            auth_failures_total,
            payment_sessions_total,
        })
    }

    /// Record a completed proxied request.
    pub fn record_proxy(&self, shard: i32, status: u16, latency_secs: f64) {
        let shard = shard.to_string();
        self.proxy_requests_total
            .with_label_values(&[&shard, &status.to_string()])
            .inc();
        self.upstream_latency
            .with_label_values(&[&shard])
            .observe(latency_secs);
    }

    /// Get Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metrics, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
