//! Prediction cache.
//!
//! [`CacheClient`] wraps a key/value [`CacheStore`] behind the "cache" circuit
//! breaker. Cache trouble never fails a request: an open breaker turns `get`
//! into a miss and `set` into a no-op, and store errors are logged, counted
//! against the breaker and swallowed.

use crate::circuit_breaker::CircuitBreaker;
use crate::timeout::with_timeout;
use async_trait::async_trait;
use chrono::Utc;
use gateway_core::{
    noop_recorder, GatewayError, GatewayResult, InferenceInput, ModelIdentity, SharedRecorder,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Dependency name of the cache
pub const CACHE_DEPENDENCY: &str = "cache";

/// Deterministic cache key for one prediction input
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `input` served by `model`
    ///
    /// The digest covers the feature vector, the non-null parameters in
    /// sorted order and the model identity, so parameter ordering never
    /// changes the key.
    #[must_use]
    pub fn for_input(model: &ModelIdentity, input: &InferenceInput) -> Self {
        let parameters: BTreeMap<&str, &Value> = input
            .parameters
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.as_str(), v))
            .collect();

        let canonical = serde_json::json!({
            "model": model.name,
            "version": model.version,
            "features": input.features,
            "parameters": parameters,
        });

        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Self(format!(
            "predict:{}:{}:{}",
            model.name,
            model.version,
            hex::encode(digest)
        ))
    }

    /// Key as stored
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Remote or local key/value store
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Store kind, for logs
    fn kind(&self) -> &'static str;

    /// Fetch a value
    ///
    /// # Errors
    /// Returns `GatewayError` if the store cannot be reached
    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    /// Store a value that the store may drop after `ttl`
    ///
    /// # Errors
    /// Returns `GatewayError` if the store cannot be reached
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> GatewayResult<()>;

    /// Remove a value, returning whether it existed
    ///
    /// # Errors
    /// Returns `GatewayError` if the store cannot be reached
    async fn delete(&self, key: &str) -> GatewayResult<bool>;

    /// Reachability check
    ///
    /// # Errors
    /// Returns `GatewayError` if the store cannot be reached
    async fn ping(&self) -> GatewayResult<()>;

    /// Drop entries whose TTL has passed, returning how many were removed
    ///
    /// Stores that expire entries themselves keep the default.
    async fn cleanup_expired(&self) -> usize {
        0
    }
}

/// Stored representation of a cached value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEnvelope {
    /// Cached value
    pub value: Value,
    /// Write time, milliseconds since the Unix epoch
    pub written_at_ms: i64,
    /// Logical time-to-live in milliseconds
    pub ttl_ms: u64,
}

impl CacheEnvelope {
    /// Wrap `value` written now
    #[must_use]
    pub fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            written_at_ms: Utc::now().timestamp_millis(),
            ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Whether the entry outlived its TTL at `now_ms`
    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        let age = now_ms.saturating_sub(self.written_at_ms);
        u64::try_from(age).map_or(false, |age| age > self.ttl_ms)
    }
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that fell through
    pub misses: u64,
    /// Store failures and timeouts
    pub errors: u64,
    /// Operations skipped because the breaker was open
    pub skipped: u64,
}

impl CacheStats {
    /// Calculate hit rate in percent
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
}

/// Breaker-guarded cache client
pub struct CacheClient {
    store: Arc<dyn CacheStore>,
    breaker: Arc<CircuitBreaker>,
    operation_timeout: Duration,
    enabled: bool,
    counters: Counters,
    recorder: SharedRecorder,
}

impl fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheClient")
            .field("store", &self.store.kind())
            .field("breaker", &self.breaker.name())
            .field("operation_timeout", &self.operation_timeout)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

enum Guarded<T> {
    Done(T),
    Failed,
    Skipped,
}

impl CacheClient {
    /// Create a cache client
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            store,
            breaker,
            operation_timeout: Duration::from_millis(250),
            enabled: true,
            counters: Counters::default(),
            recorder: noop_recorder(),
        }
    }

    /// Set the per-operation timeout
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Enable or disable caching
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Attach a metrics recorder
    #[must_use]
    pub fn with_recorder(mut self, recorder: SharedRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// Check if caching is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Breaker guarding the store
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Store kind
    #[must_use]
    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    /// Look up a value; anything other than a fresh, decodable entry is a miss
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        if !self.enabled {
            return None;
        }

        let raw = match self.guarded("get", || self.store.get(key.as_str())).await {
            Guarded::Done(raw) => raw,
            Guarded::Failed | Guarded::Skipped => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let value = raw.and_then(|raw| match serde_json::from_str::<CacheEnvelope>(&raw) {
            Ok(envelope) if envelope.is_expired_at(Utc::now().timestamp_millis()) => {
                debug!(key = %key, "Cache entry logically expired");
                None
            }
            Ok(envelope) => serde_json::from_value(envelope.value)
                .map_err(|e| warn!(key = %key, error = %e, "Cached value has unexpected shape"))
                .ok(),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        if value.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.recorder.record_cache_operation("get", "hit");
            debug!(key = %key, "Cache hit");
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.recorder.record_cache_operation("get", "miss");
            debug!(key = %key, "Cache miss");
        }
        self.recorder.set_cache_hit_rate(self.stats().hit_rate());
        value
    }

    /// Store a value for `ttl`; best effort
    pub async fn set<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        if !self.enabled {
            return;
        }

        let payload = match serde_json::to_value(value)
            .and_then(|value| serde_json::to_string(&CacheEnvelope::new(value, ttl)))
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        if let Guarded::Done(()) = self
            .guarded("set", || self.store.set_with_ttl(key.as_str(), payload, ttl))
            .await
        {
            self.recorder.record_cache_operation("set", "ok");
            debug!(key = %key, ttl_ms = ttl.as_millis(), "Response cached");
        }
    }

    /// Remove an entry, returning whether it existed
    ///
    /// # Errors
    /// Returns `DependencyUnavailable` if the breaker is open or the store
    /// failed, so operators learn the entry may still be present
    pub async fn invalidate(&self, key: &CacheKey) -> GatewayResult<bool> {
        match self.guarded("delete", || self.store.delete(key.as_str())).await {
            Guarded::Done(existed) => {
                self.recorder.record_cache_operation("delete", "ok");
                info!(key = %key, existed, "Cache entry invalidated");
                Ok(existed)
            }
            Guarded::Failed => Err(GatewayError::dependency_unavailable(
                CACHE_DEPENDENCY,
                "cache store failed",
            )),
            Guarded::Skipped => Err(GatewayError::dependency_unavailable(
                CACHE_DEPENDENCY,
                "circuit breaker is open",
            )),
        }
    }

    /// Ping the store directly, bypassing the breaker
    ///
    /// # Errors
    /// Returns `GatewayError` if the store is unreachable or slower than `timeout`
    pub async fn ping(&self, timeout: Duration) -> GatewayResult<()> {
        with_timeout(timeout, self.store.ping()).await
    }

    /// Drop expired entries from the store
    pub async fn cleanup_expired(&self) -> usize {
        self.store.cleanup_expired().await
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    async fn guarded<T, F, Fut>(&self, operation: &'static str, f: F) -> Guarded<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let timeout = self.operation_timeout;
        let started = Instant::now();
        let result = self
            .breaker
            .call(|| with_timeout(timeout, f()))
            .await;

        match result {
            Ok(value) => {
                self.recorder
                    .observe_backend_call(CACHE_DEPENDENCY, started.elapsed(), true);
                Guarded::Done(value)
            }
            Err(GatewayError::DependencyUnavailable { .. }) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                self.recorder.record_cache_operation(operation, "skipped");
                debug!(operation, "Cache skipped, circuit breaker open");
                Guarded::Skipped
            }
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.recorder.record_cache_operation(operation, "error");
                self.recorder
                    .observe_backend_call(CACHE_DEPENDENCY, started.elapsed(), false);
                warn!(operation, error = %err, "Cache operation failed");
                Guarded::Failed
            }
        }
    }
}

/// Memory store configuration
#[derive(Debug, Clone, Copy)]
pub struct MemoryStoreConfig {
    /// Maximum number of entries in the store
    pub max_entries: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
    last_access: Instant,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Bounded in-process store
///
/// Expired entries are dropped on access. When full, expired entries are
/// purged first, then the least recently used.
#[derive(Debug)]
pub struct MemoryCacheStore {
    config: MemoryStoreConfig,
    entries: RwLock<HashMap<String, MemoryEntry>>,
    evictions: AtomicU64,
}

impl MemoryCacheStore {
    /// Create a new memory store
    #[must_use]
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            evictions: AtomicU64::new(0),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(MemoryStoreConfig::default())
    }

    /// Number of stored entries, expired ones included
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Entries evicted so far
    #[must_use]
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn evict(&self, entries: &mut HashMap<String, MemoryEntry>, now: Instant) {
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed_expired = before - entries.len();

        let to_remove = (entries.len() + 1)
            .saturating_sub(self.config.max_entries)
            .min(entries.len());
        if to_remove > 0 {
            let mut by_age: Vec<(Instant, String)> = entries
                .iter()
                .map(|(k, v)| (v.last_access, k.clone()))
                .collect();
            by_age.select_nth_unstable(to_remove - 1);

            for (_, key) in by_age.into_iter().take(to_remove) {
                entries.remove(&key);
            }
        }

        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed_expired, removed_total = removed, "Cache eviction completed");
        }
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => {
                entry.last_access = now;
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> GatewayResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) && entries.len() >= self.config.max_entries {
            self.evict(&mut entries, now);
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: now + ttl,
                last_access: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn ping(&self) -> GatewayResult<()> {
        Ok(())
    }

    async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(removed, "Expired cache entries removed");
        }
        removed
    }
}
