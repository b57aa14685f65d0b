//! Configuration schema definitions.
//!
//! This module defines all configuration types with validation and defaults.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_batch_cost"))]
pub struct GatewayConfig {
    /// Server configuration
    #[validate(nested)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[validate(nested)]
    pub rate_limiting: RateLimitingConfig,

    /// Circuit breaker and retry configuration
    #[validate(nested)]
    pub resilience: ResilienceConfig,

    /// Prediction cache configuration
    #[validate(nested)]
    pub cache: CacheConfig,

    /// Model backend configuration
    #[validate(nested)]
    pub backend: BackendConfig,

    /// Input validation bounds
    #[validate(nested)]
    pub validation: ValidationConfig,

    /// Health aggregation configuration
    #[validate(nested)]
    pub health: HealthConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Validate the configuration, including per-dependency breaker overrides
    ///
    /// # Errors
    /// Returns validation errors if configuration is invalid
    pub fn validate_config(&self) -> Result<(), validator::ValidationErrors> {
        self.validate()?;
        for breaker in self.resilience.circuit_breakers.values() {
            breaker.validate()?;
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Reject zero durations for periods, intervals and timeouts
fn validate_non_zero_duration(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("zero_duration"));
    }
    Ok(())
}

/// A maximum-size batch must fit in every bucket it is charged against,
/// otherwise it is denied forever
fn validate_batch_cost(config: &GatewayConfig) -> Result<(), ValidationError> {
    let limits = &config.rate_limiting;
    if !limits.enabled {
        return Ok(());
    }

    let cost = limits.batch_cost(config.validation.max_batch_size);
    let mut capacity = limits.anonymous.capacity.min(limits.authenticated.capacity);
    if !limits.sensitive_routes.is_empty() {
        capacity = capacity.min(limits.sensitive.capacity);
    }

    if cost > capacity {
        let mut error = ValidationError::new("batch_cost_exceeds_capacity");
        error.message = Some(Cow::from(format!(
            "a batch of {} items costs {cost} tokens but the smallest bucket holds {capacity}",
            config.validation.max_batch_size
        )));
        return Err(error);
    }
    Ok(())
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    #[validate(length(min = 1))]
    pub host: String,

    /// Bind port
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Deadline for a whole request (limiter, cache, backend and retries)
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub request_timeout: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown_timeout: Duration,

    /// Maximum request body size in bytes
    #[validate(range(min = 1024))]
    pub max_request_body_size: usize,

    /// Batch items evaluated concurrently
    #[validate(range(min = 1, max = 256))]
    pub batch_concurrency: usize,

    /// Deployment environment reported by the detailed health view
    pub environment: String,

    /// CORS configuration
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(10),
            graceful_shutdown_timeout: Duration::from_secs(30),
            max_request_body_size: 1024 * 1024,
            batch_concurrency: 8,
            environment: "development".to_string(),
            cors: CorsConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Whether CORS is enabled
    pub enabled: bool,

    /// Allowed origins
    pub allowed_origins: Vec<String>,

    /// Max age for preflight cache, in seconds
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: vec!["*".to_string()],
            max_age: 86400,
        }
    }
}

/// Capacity and refill of one token bucket class
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BucketSettings {
    /// Maximum tokens held
    #[validate(range(min = 1))]
    pub capacity: u32,

    /// Tokens regenerated per refill period
    #[validate(range(min = 1))]
    pub refill_tokens: u32,

    /// Refill period
    #[serde(with = "humantime_serde", default = "default_refill_period")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub refill_period: Duration,
}

fn default_refill_period() -> Duration {
    Duration::from_secs(60)
}

impl BucketSettings {
    /// `n` tokens per minute with a burst of `n`
    #[must_use]
    pub fn per_minute(n: u32) -> Self {
        Self {
            capacity: n,
            refill_tokens: n,
            refill_period: default_refill_period(),
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitingConfig {
    /// Whether rate limiting is enabled
    pub enabled: bool,

    /// Bucket for callers identified only by IP
    #[validate(nested)]
    pub anonymous: BucketSettings,

    /// Bucket for callers with an API key or principal
    #[validate(nested)]
    pub authenticated: BucketSettings,

    /// Extra bucket charged on sensitive routes
    #[validate(nested)]
    pub sensitive: BucketSettings,

    /// Routes that also charge the sensitive bucket
    pub sensitive_routes: Vec<String>,

    /// Tokens charged per batch item (total rounded up, minimum 1)
    #[validate(range(min = 0.0, max = 100.0))]
    pub batch_item_cost: f64,

    /// How often idle buckets and expired cache entries are swept
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub cleanup_interval: Duration,

    /// Idle time after which a full bucket may be dropped
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl RateLimitingConfig {
    /// Tokens charged for a batch of `items`: `max(1, ceil(items * batch_item_cost))`
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn batch_cost(&self, items: usize) -> u32 {
        let cost = (items as f64 * self.batch_item_cost.max(0.0)).ceil() as u32;
        cost.max(1)
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anonymous: BucketSettings::per_minute(20),
            authenticated: BucketSettings::per_minute(100),
            sensitive: BucketSettings::per_minute(10),
            sensitive_routes: vec!["/batch-predict".to_string()],
            batch_item_cost: 0.1,
            cleanup_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Resilience configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Breaker settings used for any dependency without an override
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-dependency breaker overrides, keyed by dependency name
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,

    /// Retry configuration for backend calls
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[validate(range(min = 1, max = 100))]
    pub failure_threshold: u32,

    /// Half-open successes that close the circuit
    #[validate(range(min = 1, max = 100))]
    pub success_threshold: u32,

    /// Time spent open before trial calls are allowed
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub reset_timeout: Duration,

    /// Trial calls allowed in flight while half-open
    #[validate(range(min = 1, max = 100))]
    pub half_open_max_in_flight: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_max_in_flight: 1,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryConfig {
    /// Whether retry is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of retries after the first attempt
    #[validate(range(min = 0, max = 10))]
    pub max_retries: u32,

    /// Base delay between retries
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,

    /// Jitter factor (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Cache store implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStoreKind {
    /// Bounded in-process map
    #[default]
    Memory,
    /// Remote Redis server
    Redis,
}

/// Cache time-to-live per route
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    /// TTL for `/predict` results
    #[serde(with = "humantime_serde")]
    pub predict: Duration,

    /// TTL for `/batch-predict` item results
    #[serde(with = "humantime_serde")]
    pub batch_predict: Duration,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            predict: Duration::from_secs(300),
            batch_predict: Duration::from_secs(300),
        }
    }
}

/// Prediction cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is enabled
    pub enabled: bool,

    /// Store implementation
    pub store: CacheStoreKind,

    /// Redis URL (used when `store` is `redis`)
    #[validate(length(min = 1))]
    pub redis_url: String,

    /// Entry TTL per route
    pub ttl: CacheTtlConfig,

    /// Timeout applied to every store call
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub operation_timeout: Duration,

    /// Entry bound for the memory store
    #[validate(range(min = 1))]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: CacheStoreKind::Memory,
            redis_url: "redis://localhost:6379/0".to_string(),
            ttl: CacheTtlConfig::default(),
            operation_timeout: Duration::from_millis(250),
            max_entries: 10_000,
        }
    }
}

/// Model backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BackendConfig {
    /// Dependency name used for the breaker, metrics and health
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    /// Base URL
    #[validate(url)]
    pub endpoint: String,

    /// Model name reported in responses and cache keys
    #[validate(length(min = 1))]
    pub model_name: String,

    /// Model version reported in responses and cache keys
    #[validate(length(min = 1))]
    pub model_version: String,

    /// Timeout for one prediction call
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub timeout: Duration,

    /// Connection establishment timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Path probed by the health aggregator
    pub health_path: String,

    /// Environment variable holding an optional bearer token
    pub api_key_env: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            id: "model_backend".to_string(),
            endpoint: "http://localhost:8000".to_string(),
            model_name: "default".to_string(),
            model_version: "1.0.0".to_string(),
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            health_path: "/health".to_string(),
            api_key_env: None,
        }
    }
}

impl BackendConfig {
    /// Resolve the bearer token from the configured environment variable
    #[must_use]
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Input validation bounds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ValidationConfig {
    /// Maximum features per input
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_features: usize,

    /// Maximum inputs per request
    #[validate(range(min = 1, max = 10_000))]
    pub max_batch_size: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_features: 1024,
            max_batch_size: 100,
        }
    }
}

/// Health aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between background probe rounds
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub poll_interval: Duration,

    /// Timeout for a single dependency probe
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub probe_timeout: Duration,

    /// Probe latency above which a healthy dependency reports degraded
    #[serde(with = "humantime_serde")]
    pub degraded_latency: Duration,

    /// Heartbeat age after which liveness fails
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_non_zero_duration"))]
    pub liveness_stall_threshold: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            degraded_latency: Duration::from_millis(100),
            liveness_stall_threshold: Duration::from_secs(60),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Metrics configuration
    #[validate(nested)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    pub enabled: bool,

    /// Metrics endpoint path
    #[validate(length(min = 1))]
    pub endpoint: String,

    /// Histogram buckets for latency
    #[validate(length(min = 1))]
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "/metrics".to_string(),
            latency_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    #[validate(length(min = 1))]
    pub level: String,

    /// Log format
    pub format: LogFormat,

    /// Include source file and line
    pub include_location: bool,

    /// Extra filter directives
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            include_location: false,
            filter: None,
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON formatted logs
    #[default]
    Json,
    /// Human-readable pretty logs
    Pretty,
    /// Compact single-line logs
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.request_timeout, Duration::from_secs(10));
        assert_eq!(config.server.batch_concurrency, 8);
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_server_socket_addr() {
        let server = ServerConfig::default();
        assert_eq!(server.socket_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_rate_limit_defaults() {
        let config = RateLimitingConfig::default();
        assert_eq!(config.anonymous.capacity, 20);
        assert_eq!(config.authenticated.capacity, 100);
        assert_eq!(config.sensitive.capacity, 10);
        assert_eq!(config.sensitive.refill_period, Duration::from_secs(60));
        assert_eq!(config.sensitive_routes, vec!["/batch-predict".to_string()]);
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.half_open_max_in_flight, 1);
    }

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_breaker_override_rejected() {
        let mut config = GatewayConfig::default();
        config.resilience.circuit_breakers.insert(
            "cache".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 0,
                ..CircuitBreakerConfig::default()
            },
        );
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_invalid_backend_endpoint_rejected() {
        let mut config = GatewayConfig::default();
        config.backend.endpoint = "not a url".to_string();
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let cases: [fn(&mut GatewayConfig); 6] = [
            |c| c.rate_limiting.anonymous.refill_period = Duration::ZERO,
            |c| c.rate_limiting.cleanup_interval = Duration::ZERO,
            |c| c.health.poll_interval = Duration::ZERO,
            |c| c.health.probe_timeout = Duration::ZERO,
            |c| c.server.request_timeout = Duration::ZERO,
            |c| c.resilience.circuit_breaker.reset_timeout = Duration::ZERO,
        ];

        for mutate in cases {
            let mut config = GatewayConfig::default();
            mutate(&mut config);
            assert!(config.validate_config().is_err());
        }
    }

    #[test]
    fn test_zero_refill_period_in_yaml_rejected() {
        let yaml = r"
rate_limiting:
  anonymous:
    capacity: 2
    refill_tokens: 2
    refill_period: 0s
";
        let config: GatewayConfig = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(config.rate_limiting.anonymous.refill_period, Duration::ZERO);
        assert!(config.validate_config().is_err());
    }

    #[test]
    fn test_batch_cost() {
        let config = RateLimitingConfig::default();
        assert_eq!(config.batch_cost(1), 1);
        assert_eq!(config.batch_cost(10), 1);
        assert_eq!(config.batch_cost(11), 2);
        assert_eq!(config.batch_cost(100), 10);
    }

    #[test]
    fn test_unaffordable_batch_rejected() {
        let mut config = GatewayConfig::default();
        config.validation.max_batch_size = 200;
        assert!(config.validate_config().is_err());

        // Without sensitive routes only the identity buckets count
        config.rate_limiting.sensitive_routes.clear();
        assert!(config.validate_config().is_ok());

        config.rate_limiting.batch_item_cost = 1.0;
        assert!(config.validate_config().is_err());

        config.rate_limiting.enabled = false;
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_yaml_serialization() {
        let config = GatewayConfig::default();
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        assert!(yaml.contains("server:"));
        assert!(yaml.contains("port: 8080"));
        assert!(yaml.contains("rate_limiting:"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r"
cache:
  store: redis
  ttl:
    predict: 1m
rate_limiting:
  anonymous:
    capacity: 5
    refill_tokens: 5
";
        let config: GatewayConfig = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(config.cache.store, CacheStoreKind::Redis);
        assert_eq!(config.cache.ttl.predict, Duration::from_secs(60));
        assert_eq!(config.cache.ttl.batch_predict, Duration::from_secs(300));
        assert_eq!(config.rate_limiting.anonymous.capacity, 5);
        assert_eq!(
            config.rate_limiting.anonymous.refill_period,
            Duration::from_secs(60)
        );
        assert_eq!(config.rate_limiting.authenticated.capacity, 100);
    }

    #[test]
    fn test_resolve_api_key() {
        std::env::set_var("TEST_MODEL_BACKEND_TOKEN", "secret-123");
        let config = BackendConfig {
            api_key_env: Some("TEST_MODEL_BACKEND_TOKEN".to_string()),
            ..BackendConfig::default()
        };
        assert_eq!(config.resolve_api_key(), Some("secret-123".to_string()));
        std::env::remove_var("TEST_MODEL_BACKEND_TOKEN");

        assert_eq!(BackendConfig::default().resolve_api_key(), None);
    }
}
