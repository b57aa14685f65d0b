//! Prometheus metrics for the gateway.
//!
//! [`Metrics`] owns a private registry and implements
//! [`MetricsRecorder`], so every component records through the same narrow
//! interface. Series:
//! - HTTP request counts and latencies per route
//! - Rate-limit decisions per bucket class
//! - Circuit breaker transitions and current state per dependency
//! - Cache operation outcomes and hit rate
//! - Dependency call latencies

use gateway_core::MetricsRecorder;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tracing::error;

/// Namespace prefixed to every series
pub const METRICS_NAMESPACE: &str = "model_gateway";

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Histogram buckets for latency, in seconds
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            latency_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

/// Gauge value for a breaker state label
fn breaker_state_value(state: &str) -> f64 {
    match state {
        "open" => 1.0,
        "half_open" => 2.0,
        _ => 0.0,
    }
}

/// Main metrics registry and collectors
pub struct Metrics {
    registry: Registry,
    requests_total: CounterVec,
    request_duration: HistogramVec,
    rate_limit_decisions: CounterVec,
    breaker_transitions: CounterVec,
    breaker_state: GaugeVec,
    cache_operations: CounterVec,
    cache_hit_rate: Gauge,
    backend_call_duration: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create a new metrics instance
    ///
    /// # Errors
    /// Returns error if metrics cannot be registered
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("requests_total", "Total HTTP requests").namespace(METRICS_NAMESPACE),
            &["route", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "HTTP request latency in seconds")
                .namespace(METRICS_NAMESPACE)
                .buckets(config.latency_buckets.clone()),
            &["route"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let rate_limit_decisions = CounterVec::new(
            Opts::new("rate_limit_decisions_total", "Rate limiter admissions and denials")
                .namespace(METRICS_NAMESPACE),
            &["class", "decision"],
        )?;
        registry.register(Box::new(rate_limit_decisions.clone()))?;

        let breaker_transitions = CounterVec::new(
            Opts::new(
                "circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            )
            .namespace(METRICS_NAMESPACE),
            &["dependency", "from", "to"],
        )?;
        registry.register(Box::new(breaker_transitions.clone()))?;

        let breaker_state = GaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            )
            .namespace(METRICS_NAMESPACE),
            &["dependency"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let cache_operations = CounterVec::new(
            Opts::new("cache_operations_total", "Cache operations by outcome")
                .namespace(METRICS_NAMESPACE),
            &["operation", "result"],
        )?;
        registry.register(Box::new(cache_operations.clone()))?;

        let cache_hit_rate = Gauge::with_opts(
            Opts::new("cache_hit_rate_percent", "Cache hit rate since startup")
                .namespace(METRICS_NAMESPACE),
        )?;
        registry.register(Box::new(cache_hit_rate.clone()))?;

        let backend_call_duration = HistogramVec::new(
            HistogramOpts::new(
                "backend_call_duration_seconds",
                "Dependency call latency in seconds",
            )
            .namespace(METRICS_NAMESPACE)
            .buckets(config.latency_buckets.clone()),
            &["dependency", "outcome"],
        )?;
        registry.register(Box::new(backend_call_duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            rate_limit_decisions,
            breaker_transitions,
            breaker_state,
            cache_operations,
            cache_hit_rate,
            backend_call_duration,
        })
    }

    /// Set the breaker state gauge directly (used to seed known dependencies)
    pub fn set_breaker_state(&self, dependency: &str, state: &str) {
        self.breaker_state
            .with_label_values(&[dependency])
            .set(breaker_state_value(state));
    }

    /// Get metrics as Prometheus text format
    #[must_use]
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Get the Prometheus registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl MetricsRecorder for Metrics {
    fn record_admission(&self, class: &str, admitted: bool) {
        let decision = if admitted { "allowed" } else { "denied" };
        self.rate_limit_decisions
            .with_label_values(&[class, decision])
            .inc();
    }

    fn record_breaker_transition(&self, dependency: &str, from: &str, to: &str) {
        self.breaker_transitions
            .with_label_values(&[dependency, from, to])
            .inc();
        self.set_breaker_state(dependency, to);
    }

    fn record_cache_operation(&self, operation: &str, outcome: &str) {
        self.cache_operations
            .with_label_values(&[operation, outcome])
            .inc();
    }

    fn set_cache_hit_rate(&self, percent: f64) {
        self.cache_hit_rate.set(percent);
    }

    fn observe_backend_call(&self, dependency: &str, duration: Duration, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.backend_call_duration
            .with_label_values(&[dependency, outcome])
            .observe(duration.as_secs_f64());
    }

    fn record_request(&self, route: &str, status: u16, duration: Duration) {
        self.requests_total
            .with_label_values(&[route, &status.to_string()])
            .inc();
        self.request_duration
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Metrics {
        Metrics::new(&MetricsConfig::default()).unwrap()
    }

    #[test]
    fn test_metrics_creation() {
        assert!(Metrics::new(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_record_request() {
        let metrics = metrics();
        metrics.record_request("/predict", 200, Duration::from_millis(12));

        let output = metrics.gather();
        assert!(output.contains("model_gateway_requests_total"));
        assert!(output.contains("route=\"/predict\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("model_gateway_request_duration_seconds"));
    }

    #[test]
    fn test_admissions() {
        let metrics = metrics();
        metrics.record_admission("anonymous", true);
        metrics.record_admission("anonymous", false);

        let output = metrics.gather();
        assert!(output.contains("decision=\"allowed\""));
        assert!(output.contains("decision=\"denied\""));
    }

    #[test]
    fn test_breaker_transition_updates_gauge() {
        let metrics = metrics();
        metrics.record_breaker_transition("model_backend", "closed", "open");

        let output = metrics.gather();
        assert!(output.contains("model_gateway_circuit_breaker_transitions_total"));
        assert!(output.contains("model_gateway_circuit_breaker_state{dependency=\"model_backend\"} 1"));

        metrics.record_breaker_transition("model_backend", "open", "half_open");
        assert!(metrics
            .gather()
            .contains("model_gateway_circuit_breaker_state{dependency=\"model_backend\"} 2"));
    }

    #[test]
    fn test_cache_and_backend_series() {
        let metrics = metrics();
        metrics.record_cache_operation("get", "hit");
        metrics.set_cache_hit_rate(50.0);
        metrics.observe_backend_call("model_backend", Duration::from_millis(30), true);

        let output = metrics.gather();
        assert!(output.contains("model_gateway_cache_operations_total"));
        assert!(output.contains("model_gateway_cache_hit_rate_percent 50"));
        assert!(output.contains("model_gateway_backend_call_duration_seconds"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }
}
