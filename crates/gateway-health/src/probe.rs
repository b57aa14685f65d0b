//! Dependency probes.
//!
//! A probe pings one dependency directly, without going through its breaker
//! and without touching the rate limiter.

use async_trait::async_trait;
use gateway_core::{GatewayResult, ModelBackend};
use gateway_resilience::{CacheClient, CircuitBreaker, CACHE_DEPENDENCY};
use std::sync::Arc;
use std::time::Duration;

/// A dependency the aggregator can check
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    /// Dependency name, matching its breaker
    fn name(&self) -> &str;

    /// Whether the gateway cannot serve correctly without this dependency
    fn required(&self) -> bool;

    /// Breaker guarding this dependency
    fn breaker(&self) -> &Arc<CircuitBreaker>;

    /// Ping the dependency once
    ///
    /// # Errors
    /// Returns `GatewayError` if the dependency does not answer healthily
    async fn probe(&self) -> GatewayResult<()>;
}

/// Probe for the prediction cache store; optional for readiness
pub struct CacheProbe {
    cache: Arc<CacheClient>,
    timeout: Duration,
}

impl CacheProbe {
    /// Create a cache probe with its own ping timeout
    #[must_use]
    pub fn new(cache: Arc<CacheClient>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }
}

#[async_trait]
impl DependencyProbe for CacheProbe {
    fn name(&self) -> &str {
        CACHE_DEPENDENCY
    }

    fn required(&self) -> bool {
        false
    }

    fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.cache.breaker()
    }

    async fn probe(&self) -> GatewayResult<()> {
        self.cache.ping(self.timeout).await
    }
}

/// Probe for the model backend; required for readiness
pub struct BackendProbe {
    backend: Arc<dyn ModelBackend>,
    breaker: Arc<CircuitBreaker>,
}

impl BackendProbe {
    /// Create a backend probe
    #[must_use]
    pub fn new(backend: Arc<dyn ModelBackend>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { backend, breaker }
    }
}

#[async_trait]
impl DependencyProbe for BackendProbe {
    fn name(&self) -> &str {
        self.backend.id()
    }

    fn required(&self) -> bool {
        true
    }

    fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn probe(&self) -> GatewayResult<()> {
        self.backend.health_check().await
    }
}
