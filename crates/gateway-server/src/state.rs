//! Application state shared across handlers.

use gateway_backend::{HttpBackendConfig, HttpModelBackend};
use gateway_config::{
    BucketSettings, CacheConfig, CacheStoreKind, GatewayConfig, RateLimitingConfig, RetryConfig,
};
use gateway_core::{noop_recorder, InputLimits, ModelBackend, ModelIdentity, SharedRecorder};
use gateway_health::{BackendProbe, CacheProbe, HealthAggregator, HealthConfig};
use gateway_resilience::{
    BucketConfig, CacheClient, CacheStore, CircuitBreakerConfig, CircuitBreakerRegistry,
    MemoryCacheStore, MemoryStoreConfig, RateLimiter, RateLimiterConfig, RetryPolicy,
    CACHE_DEPENDENCY,
};
use gateway_telemetry::{Metrics, MetricsConfig};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pipeline::{PipelineSettings, PredictionGateway};
use crate::server::ServerError;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Configuration loaded at startup
    pub config: Arc<GatewayConfig>,
    /// Prediction pipeline
    pub gateway: Arc<PredictionGateway>,
    /// Health aggregator
    pub health: Arc<HealthAggregator>,
    /// Rate limiter
    pub limiter: Arc<RateLimiter>,
    /// Circuit breakers per dependency
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Prometheus metrics, when enabled
    pub metrics: Option<Arc<Metrics>>,
    /// Recorder every component reports through
    pub recorder: SharedRecorder,
}

impl AppState {
    /// Create a new application state builder
    #[must_use]
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    /// Start the health poller and the cleanup loop for idle buckets and
    /// expired cache entries
    #[must_use]
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let limiter = Arc::clone(&self.limiter);
        let cache = Arc::clone(self.gateway.cache());
        let interval = self.config.rate_limiting.cleanup_interval;
        let idle = self.config.rate_limiting.idle_timeout;

        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup(idle);
                if removed > 0 {
                    debug!(removed, remaining = limiter.key_count(), "Evicted idle buckets");
                }
                cache.cleanup_expired().await;
            }
        });

        vec![self.health.spawn_poller(), cleanup]
    }
}

/// Builder for application state
#[derive(Default)]
pub struct AppStateBuilder {
    config: Option<GatewayConfig>,
    backend: Option<Arc<dyn ModelBackend>>,
    cache_store: Option<Arc<dyn CacheStore>>,
}

impl AppStateBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this backend instead of the configured HTTP backend
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use this cache store instead of the configured one
    #[must_use]
    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Build the application state
    ///
    /// # Errors
    /// Returns `ServerError::Config` if a component cannot be created from
    /// the configuration
    pub fn build(self) -> Result<AppState, ServerError> {
        let config = self.config.unwrap_or_default();

        let metrics = if config.observability.metrics.enabled {
            let metrics_config = MetricsConfig {
                latency_buckets: config.observability.metrics.latency_buckets.clone(),
            };
            let metrics = Metrics::new(&metrics_config)
                .map_err(|e| ServerError::Config(format!("Failed to register metrics: {e}")))?;
            Some(Arc::new(metrics))
        } else {
            None
        };
        let recorder: SharedRecorder = match &metrics {
            Some(metrics) => Arc::clone(metrics) as SharedRecorder,
            None => noop_recorder(),
        };

        let breakers = Arc::new(
            config
                .resilience
                .circuit_breakers
                .iter()
                .fold(
                    CircuitBreakerRegistry::new(breaker_config(&config.resilience.circuit_breaker)),
                    |registry, (name, overrides)| {
                        registry.with_override(name.clone(), breaker_config(overrides))
                    },
                )
                .with_recorder(recorder.clone()),
        );

        let backend = match self.backend {
            Some(backend) => backend,
            None => http_backend(&config)?,
        };
        let backend_breaker = breakers.get_or_create(backend.id());

        let store = match self.cache_store {
            Some(store) => store,
            None => cache_store(&config.cache)?,
        };
        let cache = Arc::new(
            CacheClient::new(store, breakers.get_or_create(CACHE_DEPENDENCY))
                .with_operation_timeout(config.cache.operation_timeout)
                .with_enabled(config.cache.enabled)
                .with_recorder(recorder.clone()),
        );

        if let Some(metrics) = &metrics {
            for (name, state) in breakers.all_states() {
                metrics.set_breaker_state(&name, state.as_str());
            }
        }

        let limiter = Arc::new(
            RateLimiter::new(limiter_config(&config.rate_limiting)).with_recorder(recorder.clone()),
        );

        let gateway = PredictionGateway::new(
            Arc::clone(&backend),
            Arc::clone(&backend_breaker),
            Arc::clone(&cache),
            Arc::clone(&limiter),
        )
        .with_retry(retry_policy(&config.resilience.retry))
        .with_settings(pipeline_settings(&config))
        .with_recorder(recorder.clone());

        let mut health = HealthAggregator::new(HealthConfig {
            poll_interval: config.health.poll_interval,
            probe_timeout: config.health.probe_timeout,
            degraded_latency: config.health.degraded_latency,
            liveness_stall_threshold: config.health.liveness_stall_threshold,
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: config.server.environment.clone(),
        })
        .with_probe(Arc::new(BackendProbe::new(backend, backend_breaker)));
        if config.cache.enabled {
            health = health.with_probe(Arc::new(CacheProbe::new(
                Arc::clone(&cache),
                config.health.probe_timeout,
            )));
        }

        info!(
            model = %gateway.model().name,
            version = %gateway.model().version,
            cache = cache.store_kind(),
            rate_limiting = limiter.is_enabled(),
            metrics = metrics.is_some(),
            "Application state initialized"
        );

        Ok(AppState {
            config: Arc::new(config),
            gateway: Arc::new(gateway),
            health: Arc::new(health),
            limiter,
            breakers,
            metrics,
            recorder,
        })
    }
}

fn http_backend(config: &GatewayConfig) -> Result<Arc<dyn ModelBackend>, ServerError> {
    let settings = &config.backend;
    let mut backend_config = HttpBackendConfig::new(
        settings.id.clone(),
        settings.endpoint.clone(),
        ModelIdentity::new(settings.model_name.clone(), settings.model_version.clone()),
    )
    .with_timeout(settings.timeout)
    .with_connect_timeout(settings.connect_timeout)
    .with_health_path(settings.health_path.clone());
    if let Some(key) = settings.resolve_api_key() {
        backend_config = backend_config.with_api_key(key);
    }

    let backend = HttpModelBackend::new(backend_config)
        .map_err(|e| ServerError::Config(format!("Failed to create model backend: {e}")))?;
    Ok(Arc::new(backend))
}

fn cache_store(config: &CacheConfig) -> Result<Arc<dyn CacheStore>, ServerError> {
    match config.store {
        CacheStoreKind::Memory => Ok(Arc::new(MemoryCacheStore::new(MemoryStoreConfig {
            max_entries: config.max_entries,
        }))),
        #[cfg(feature = "redis")]
        CacheStoreKind::Redis => {
            let store = gateway_resilience::RedisCacheStore::new(&config.redis_url)
                .map_err(|e| ServerError::Config(format!("Failed to create Redis store: {e}")))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        CacheStoreKind::Redis => {
            tracing::warn!("Redis support not compiled in, falling back to the memory store");
            Ok(Arc::new(MemoryCacheStore::new(MemoryStoreConfig {
                max_entries: config.max_entries,
            })))
        }
    }
}

fn breaker_config(config: &gateway_config::CircuitBreakerConfig) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: config.failure_threshold,
        success_threshold: config.success_threshold,
        reset_timeout: config.reset_timeout,
        half_open_max_in_flight: config.half_open_max_in_flight,
    }
}

fn bucket_config(settings: &BucketSettings) -> BucketConfig {
    BucketConfig {
        capacity: f64::from(settings.capacity),
        refill_tokens: f64::from(settings.refill_tokens),
        refill_period: settings.refill_period,
    }
}

fn limiter_config(config: &RateLimitingConfig) -> RateLimiterConfig {
    RateLimiterConfig {
        enabled: config.enabled,
        anonymous: bucket_config(&config.anonymous),
        authenticated: bucket_config(&config.authenticated),
        sensitive: bucket_config(&config.sensitive),
    }
}

fn retry_policy(config: &RetryConfig) -> RetryPolicy {
    if !config.enabled {
        return RetryPolicy::none();
    }
    RetryPolicy {
        max_retries: config.max_retries,
        base_delay: config.base_delay,
        max_delay: config.max_delay,
        multiplier: config.multiplier,
        jitter: config.jitter,
    }
}

fn pipeline_settings(config: &GatewayConfig) -> PipelineSettings {
    PipelineSettings {
        request_timeout: config.server.request_timeout,
        batch_concurrency: config.server.batch_concurrency,
        predict_ttl: config.cache.ttl.predict,
        batch_ttl: config.cache.ttl.batch_predict,
        limits: InputLimits {
            max_features: config.validation.max_features,
            max_batch_size: config.validation.max_batch_size,
        },
        batch_item_cost: config.rate_limiting.batch_item_cost,
        sensitive_routes: config.rate_limiting.sensitive_routes.clone(),
    }
}
