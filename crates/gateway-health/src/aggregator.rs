//! Health aggregation.
//!
//! Breaker state is the source of truth for whether a dependency is usable.
//! Probe results only refine it: they add latency and error detail, and a
//! slow or failed probe downgrades a closed breaker's Healthy to Degraded.

use crate::probe::DependencyProbe;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use gateway_resilience::{with_timeout, CircuitState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Health of a dependency or of the gateway as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully usable
    Healthy,
    /// Usable, but slow or recovering
    Degraded,
    /// Not usable
    Unavailable,
}

impl HealthStatus {
    /// Label used in responses and logs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }

    /// Whether the dependency may be used at all
    #[must_use]
    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }

    fn from_breaker(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Healthy,
            CircuitState::HalfOpen => Self::Degraded,
            CircuitState::Open => Self::Unavailable,
        }
    }
}

/// Derived health of one dependency
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    /// Status
    pub status: HealthStatus,
    /// Latency of the last probe in milliseconds
    pub latency_ms: f64,
    /// Error from the last probe, if it failed
    pub message: Option<String>,
    /// When the dependency was last probed (or the record built, if never)
    pub last_check: DateTime<Utc>,
    /// Breaker state the status was derived from
    pub circuit_state: &'static str,
    /// Whether readiness depends on this dependency
    pub required: bool,
}

/// Answer to a liveness or readiness probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    /// Status
    pub status: HealthStatus,
    /// Required dependencies that are unavailable
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failing: Vec<String>,
    /// Report time
    pub timestamp: DateTime<Utc>,
}

impl ProbeReport {
    fn new(status: HealthStatus, failing: Vec<String>) -> Self {
        Self {
            status,
            failing,
            timestamp: Utc::now(),
        }
    }

    /// Whether the probe passes
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Full health view
#[derive(Debug, Clone, Serialize)]
pub struct DetailedHealth {
    /// Overall status
    pub status: HealthStatus,
    /// Gateway version
    pub version: String,
    /// Deployment environment
    pub environment: String,
    /// Report time
    pub timestamp: DateTime<Utc>,
    /// Seconds since the aggregator was created
    pub uptime_seconds: u64,
    /// Per-dependency records
    pub dependencies: BTreeMap<String, HealthRecord>,
}

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between background probe rounds
    pub poll_interval: Duration,
    /// Timeout for a single probe
    pub probe_timeout: Duration,
    /// Probe latency above which a healthy dependency reports degraded
    pub degraded_latency: Duration,
    /// Heartbeat age after which liveness fails
    pub liveness_stall_threshold: Duration,
    /// Version reported by the detailed view
    pub version: String,
    /// Environment reported by the detailed view
    pub environment: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            degraded_latency: Duration::from_millis(100),
            liveness_stall_threshold: Duration::from_secs(60),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Observation {
    latency: Duration,
    error: Option<String>,
    checked_at: DateTime<Utc>,
}

/// Reduces dependency probes and breaker states to health views
pub struct HealthAggregator {
    config: HealthConfig,
    probes: Vec<Arc<dyn DependencyProbe>>,
    observations: RwLock<HashMap<String, Observation>>,
    last_round: Mutex<Option<Instant>>,
    heartbeat: Mutex<Option<Instant>>,
    started_at: Instant,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("probes", &self.probes.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl HealthAggregator {
    /// Create an aggregator with no probes
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            probes: Vec::new(),
            observations: RwLock::new(HashMap::new()),
            last_round: Mutex::new(None),
            heartbeat: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    /// Register a dependency probe
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn DependencyProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Run every probe concurrently, each under its own timeout
    ///
    /// Results are recorded for the detailed view and fed to the breaker,
    /// which only reacts while closed.
    pub async fn probe_all(&self) {
        let timeout = self.config.probe_timeout;
        let rounds = self.probes.iter().map(|probe| async move {
            let start = Instant::now();
            let result = with_timeout(timeout, probe.probe()).await;
            let latency = start.elapsed();

            probe.breaker().record_probe(result.is_ok());

            let error = match result {
                Ok(()) => {
                    debug!(dependency = %probe.name(), latency_ms = latency.as_millis() as u64, "Probe succeeded");
                    None
                }
                Err(e) => {
                    warn!(dependency = %probe.name(), error = %e, "Probe failed");
                    Some(e.to_string())
                }
            };

            (
                probe.name().to_string(),
                Observation {
                    latency,
                    error,
                    checked_at: Utc::now(),
                },
            )
        });

        let results = join_all(rounds).await;

        self.observations.write().extend(results);
        *self.last_round.lock() = Some(Instant::now());
    }

    /// Probe again if the last round is older than the poll interval
    pub async fn refresh_if_stale(&self) {
        let stale = self
            .last_round
            .lock()
            .map_or(true, |at| at.elapsed() >= self.config.poll_interval);
        if stale {
            self.probe_all().await;
        }
    }

    /// Stamp the liveness heartbeat
    pub fn beat(&self) {
        *self.heartbeat.lock() = Some(Instant::now());
    }

    /// Process self-check, independent of dependencies
    #[must_use]
    pub fn liveness(&self) -> ProbeReport {
        let stalled = self
            .heartbeat
            .lock()
            .is_some_and(|at| at.elapsed() > self.config.liveness_stall_threshold);

        if stalled {
            ProbeReport::new(HealthStatus::Unavailable, vec!["heartbeat".to_string()])
        } else {
            ProbeReport::new(HealthStatus::Healthy, Vec::new())
        }
    }

    /// Whether every required dependency is usable
    #[must_use]
    pub fn readiness(&self) -> ProbeReport {
        let failing: Vec<String> = self
            .probes
            .iter()
            .filter(|probe| probe.required())
            .filter(|probe| {
                !HealthStatus::from_breaker(probe.breaker().state()).is_available()
            })
            .map(|probe| probe.name().to_string())
            .collect();

        if failing.is_empty() {
            ProbeReport::new(HealthStatus::Healthy, failing)
        } else {
            ProbeReport::new(HealthStatus::Unavailable, failing)
        }
    }

    /// Per-dependency records and overall status
    #[must_use]
    pub fn detailed(&self) -> DetailedHealth {
        let observations = self.observations.read();
        let dependencies: BTreeMap<String, HealthRecord> = self
            .probes
            .iter()
            .map(|probe| {
                let record = self.record_for(probe.as_ref(), observations.get(probe.name()));
                (probe.name().to_string(), record)
            })
            .collect();
        drop(observations);

        let status = overall_status(dependencies.values());

        DetailedHealth {
            status,
            version: self.config.version.clone(),
            environment: self.config.environment.clone(),
            timestamp: Utc::now(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            dependencies,
        }
    }

    fn record_for(
        &self,
        probe: &dyn DependencyProbe,
        observation: Option<&Observation>,
    ) -> HealthRecord {
        let state = probe.breaker().state();
        let mut status = HealthStatus::from_breaker(state);

        if status == HealthStatus::Healthy {
            if let Some(obs) = observation {
                if obs.error.is_some() || obs.latency > self.config.degraded_latency {
                    status = HealthStatus::Degraded;
                }
            }
        }

        HealthRecord {
            status,
            latency_ms: observation.map_or(0.0, |obs| obs.latency.as_secs_f64() * 1000.0),
            message: observation.and_then(|obs| obs.error.clone()),
            last_check: observation.map_or_else(Utc::now, |obs| obs.checked_at),
            circuit_state: state.as_str(),
            required: probe.required(),
        }
    }

    /// Spawn the background poller: heartbeat plus a probe round per tick
    pub fn spawn_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        info!(
            interval_ms = aggregator.config.poll_interval.as_millis() as u64,
            probes = aggregator.probes.len(),
            "Starting health poller"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                aggregator.beat();
                aggregator.probe_all().await;
            }
        })
    }
}

/// Unavailable if a required dependency is down, degraded if anything else
/// is less than healthy
fn overall_status<'a>(records: impl Iterator<Item = &'a HealthRecord>) -> HealthStatus {
    let mut status = HealthStatus::Healthy;
    for record in records {
        let contribution = match record.status {
            HealthStatus::Unavailable if record.required => HealthStatus::Unavailable,
            HealthStatus::Healthy => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        };
        status = status.max(contribution);
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_core::{GatewayError, GatewayResult};
    use gateway_resilience::{CircuitBreaker, CircuitBreakerConfig};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct StubProbe {
        name: &'static str,
        required: bool,
        breaker: Arc<CircuitBreaker>,
        healthy: AtomicBool,
        delay: Duration,
        calls: AtomicU32,
    }

    impl StubProbe {
        fn new(name: &'static str, required: bool) -> Self {
            Self {
                name,
                required,
                breaker: Arc::new(CircuitBreaker::new(name, CircuitBreakerConfig::default())),
                healthy: AtomicBool::new(true),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl DependencyProbe for StubProbe {
        fn name(&self) -> &str {
            self.name
        }

        fn required(&self) -> bool {
            self.required
        }

        fn breaker(&self) -> &Arc<CircuitBreaker> {
            &self.breaker
        }

        async fn probe(&self) -> GatewayResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(GatewayError::backend(self.name, "connection refused", None, true))
            }
        }
    }

    fn setup() -> (Arc<StubProbe>, Arc<StubProbe>, HealthAggregator) {
        let backend = Arc::new(StubProbe::new("model_backend", true));
        let cache = Arc::new(StubProbe::new("cache", false));
        let aggregator = HealthAggregator::new(HealthConfig::default())
            .with_probe(backend.clone())
            .with_probe(cache.clone());
        (backend, cache, aggregator)
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let (_, _, aggregator) = setup();
        aggregator.probe_all().await;

        assert!(aggregator.liveness().is_healthy());
        assert!(aggregator.readiness().is_healthy());

        let detailed = aggregator.detailed();
        assert_eq!(detailed.status, HealthStatus::Healthy);
        assert_eq!(detailed.dependencies.len(), 2);
        assert_eq!(detailed.dependencies["cache"].circuit_state, "closed");
    }

    #[tokio::test]
    async fn test_backend_open_means_not_ready_but_alive() {
        let (backend, _, aggregator) = setup();
        backend.breaker.trip();

        let readiness = aggregator.readiness();
        assert_eq!(readiness.status, HealthStatus::Unavailable);
        assert_eq!(readiness.failing, vec!["model_backend".to_string()]);
        assert!(aggregator.liveness().is_healthy());

        let detailed = aggregator.detailed();
        assert_eq!(detailed.status, HealthStatus::Unavailable);
        assert_eq!(
            detailed.dependencies["model_backend"].status,
            HealthStatus::Unavailable
        );
        assert_eq!(detailed.dependencies["cache"].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_cache_open_still_ready() {
        let (_, cache, aggregator) = setup();
        cache.breaker.trip();

        assert!(aggregator.readiness().is_healthy());

        let detailed = aggregator.detailed();
        assert_eq!(detailed.status, HealthStatus::Degraded);
        assert_eq!(detailed.dependencies["cache"].status, HealthStatus::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_is_degraded() {
        let (backend, _, aggregator) = setup();
        backend.breaker.trip();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(backend.breaker.state(), CircuitState::HalfOpen);
        assert_eq!(
            aggregator.detailed().dependencies["model_backend"].status,
            HealthStatus::Degraded
        );
        assert!(aggregator.readiness().is_healthy());
    }

    #[tokio::test]
    async fn test_failed_probe_counts_against_closed_breaker() {
        let (backend, _, aggregator) = setup();
        backend.healthy.store(false, Ordering::SeqCst);

        aggregator.probe_all().await;
        let record = &aggregator.detailed().dependencies["model_backend"];
        assert_eq!(record.status, HealthStatus::Degraded);
        assert!(record.message.as_deref().is_some_and(|m| m.contains("connection refused")));
        assert_eq!(backend.breaker.snapshot().failure_count, 1);

        for _ in 0..4 {
            aggregator.probe_all().await;
        }
        assert_eq!(backend.breaker.state(), CircuitState::Open);
        assert!(!aggregator.readiness().is_healthy());
    }

    #[tokio::test]
    async fn test_probe_does_not_move_open_breaker() {
        let (backend, _, aggregator) = setup();
        backend.breaker.trip();

        aggregator.probe_all().await;
        assert_eq!(backend.breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_is_degraded() {
        let backend = Arc::new(StubProbe::new("model_backend", true));
        let cache = Arc::new(StubProbe::new("cache", false).with_delay(Duration::from_millis(150)));
        let aggregator = HealthAggregator::new(HealthConfig::default())
            .with_probe(backend)
            .with_probe(cache);

        aggregator.probe_all().await;

        let detailed = aggregator.detailed();
        assert_eq!(detailed.dependencies["cache"].status, HealthStatus::Degraded);
        assert!(detailed.dependencies["cache"].latency_ms >= 150.0);
        assert_eq!(detailed.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out() {
        let backend =
            Arc::new(StubProbe::new("model_backend", true).with_delay(Duration::from_secs(60)));
        let aggregator = HealthAggregator::new(HealthConfig::default()).with_probe(backend.clone());

        aggregator.probe_all().await;

        let record = &aggregator.detailed().dependencies["model_backend"];
        assert!(record.message.is_some());
        assert_eq!(backend.breaker.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_if_stale() {
        let (backend, _, aggregator) = setup();

        aggregator.refresh_if_stale().await;
        aggregator.refresh_if_stale().await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        aggregator.refresh_if_stale().await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_detects_stalled_heartbeat() {
        let (_, _, aggregator) = setup();
        assert!(aggregator.liveness().is_healthy());

        aggregator.beat();
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(aggregator.liveness().is_healthy());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(aggregator.liveness().status, HealthStatus::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_keeps_heartbeat_fresh() {
        let (backend, _, aggregator) = setup();
        let aggregator = Arc::new(aggregator);
        let handle = aggregator.spawn_poller();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        assert!(aggregator.liveness().is_healthy());
        assert!(backend.calls.load(Ordering::SeqCst) >= 10);
        handle.abort();
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unavailable).unwrap(),
            "\"unavailable\""
        );
        assert_eq!(HealthStatus::Degraded.as_str(), "degraded");
    }
}
