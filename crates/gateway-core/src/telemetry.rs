//! Narrow metrics interface used by the core components.
//!
//! Components record through [`MetricsRecorder`] and never depend on a
//! concrete metrics backend. Every method has a no-op default, so a missing
//! or broken sink degrades to [`NoopRecorder`] without affecting requests.

use std::sync::Arc;
use std::time::Duration;

/// Sink for gateway metrics
pub trait MetricsRecorder: Send + Sync + 'static {
    /// A rate-limit decision for a bucket of the given class
    fn record_admission(&self, _class: &str, _admitted: bool) {}

    /// A circuit breaker changed state
    fn record_breaker_transition(&self, _dependency: &str, _from: &str, _to: &str) {}

    /// A cache operation finished with the given outcome (`hit`, `miss`, `ok`, `error`, `skipped`)
    fn record_cache_operation(&self, _operation: &str, _outcome: &str) {}

    /// Cache hit rate in percent since startup
    fn set_cache_hit_rate(&self, _percent: f64) {}

    /// A call to a dependency finished
    fn observe_backend_call(&self, _dependency: &str, _duration: Duration, _success: bool) {}

    /// An HTTP request finished
    fn record_request(&self, _route: &str, _status: u16, _duration: Duration) {}
}

/// Recorder that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {}

/// Shared recorder handle
pub type SharedRecorder = Arc<dyn MetricsRecorder>;

/// Shared no-op recorder
#[must_use]
pub fn noop_recorder() -> SharedRecorder {
    Arc::new(NoopRecorder)
}
