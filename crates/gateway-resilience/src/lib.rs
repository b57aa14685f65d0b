//! # Gateway Resilience
//!
//! Resilience patterns for the model-serving gateway:
//! - Token-bucket rate limiting per client, API key and route class
//! - Circuit breakers per dependency
//! - Retry policy with exponential backoff and jitter
//! - Timeouts and request deadlines
//! - Breaker-guarded prediction cache over memory or Redis stores

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod circuit_breaker;
pub mod rate_limiter;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod retry;
pub mod timeout;

pub use cache::{
    CacheClient, CacheEnvelope, CacheKey, CacheStats, CacheStore, MemoryCacheStore,
    MemoryStoreConfig, CACHE_DEPENDENCY,
};
pub use circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitState,
};
pub use rate_limiter::{
    Admission, BucketConfig, BucketStats, KeyClass, Quota, RateLimitKey, RateLimiter,
    RateLimiterConfig,
};
#[cfg(feature = "redis")]
pub use redis_store::{RedisCacheStore, DEFAULT_REDIS_URL};
pub use retry::RetryPolicy;
pub use timeout::{with_timeout, Deadline};
