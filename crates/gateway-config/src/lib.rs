//! # Gateway Configuration
//!
//! Configuration management for the model-serving gateway, including:
//! - Configuration schema and validation
//! - Loading from YAML/TOML/JSON files
//! - Environment variable substitution and overrides

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loader;
pub mod schema;

// Re-export main types
pub use loader::{load_config, ConfigError, ConfigLoader, ConfigSource, ENV_PREFIX};
pub use schema::{
    BackendConfig, BucketSettings, CacheConfig, CacheStoreKind, CacheTtlConfig,
    CircuitBreakerConfig, CorsConfig, GatewayConfig, HealthConfig, LogFormat, LoggingConfig,
    MetricsConfig, ObservabilityConfig, RateLimitingConfig, ResilienceConfig, RetryConfig,
    ServerConfig, ValidationConfig,
};
