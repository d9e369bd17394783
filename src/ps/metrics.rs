use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "perfsentry";

/// Prometheus metrics for the parameter server.
pub struct PsMetrics {
    registry: Registry,

    /// Requests by route and outcome.
    pub requests_total: IntCounterVec,
    /// Functions per `update_all` batch.
    pub update_batch_size: Histogram,
    /// Functions currently held by the store.
    pub functions_tracked: IntGauge,
    /// Time spent merging one request into the store, by route.
    pub merge_duration: HistogramVec,
}

impl PsMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("ps_requests_total", "Parameter server requests by route and status.")
                .namespace(NAMESPACE),
            &["route", "status"],
        )?;
        let update_batch_size = Histogram::with_opts(
            HistogramOpts::new(
                "ps_update_batch_size",
                "Number of functions per update_all request.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![1.0, 4.0, 16.0, 64.0, 256.0, 1024.0, 4096.0]),
        )?;
        let functions_tracked = IntGauge::with_opts(
            Opts::new("ps_functions_tracked", "Number of functions held by the store.")
                .namespace(NAMESPACE),
        )?;
        let merge_duration = HistogramVec::new(
            HistogramOpts::new(
                "ps_merge_duration_seconds",
                "Time spent merging a request into the store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005,
            ]),
            &["route"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(update_batch_size.clone()))?;
        registry.register(Box::new(functions_tracked.clone()))?;
        registry.register(Box::new(merge_duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            update_batch_size,
            functions_tracked,
            merge_duration,
        })
    }

    pub fn record_request(&self, route: &str, status: &str) {
        self.requests_total.with_label_values(&[route, status]).inc();
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
