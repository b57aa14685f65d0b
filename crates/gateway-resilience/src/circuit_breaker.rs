//! Per-dependency circuit breaker.
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open → HalfOpen
//! once `reset_timeout` has elapsed (checked lazily). HalfOpen admits at most
//! `half_open_max_in_flight` trial calls; `success_threshold` successes close
//! the breaker, any failure reopens it.
//!
//! Calls are tracked through a [`BreakerPermit`]. A permit dropped without an
//! outcome (the surrounding future was cancelled) counts as a failure.

use dashmap::DashMap;
use gateway_core::{noop_recorder, GatewayError, GatewayResult, SharedRecorder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// Half-open successes that close the breaker
    pub success_threshold: u32,
    /// Time spent open before trial calls are allowed
    pub reset_timeout: Duration,
    /// Concurrent trial calls allowed while half-open
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

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls pass
    Closed,
    /// Calls short-circuit
    Open,
    /// Limited trial calls pass
    HalfOpen,
}

impl CircuitState {
    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub failure_count: u32,
    /// Successes recorded in the current half-open period
    pub half_open_successes: u32,
    /// Trial calls currently in flight
    pub in_flight: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    in_flight: u32,
    opened_at: Option<Instant>,
    // Bumped on every transition so outcomes from an earlier state are dropped
    generation: u64,
}

type Transition = (CircuitState, CircuitState);

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            in_flight: 0,
            opened_at: None,
            generation: 0,
        }
    }

    fn move_to(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.generation += 1;
        self.failure_count = 0;
        self.half_open_successes = 0;
        self.in_flight = 0;
        self.opened_at = (to == CircuitState::Open).then_some(now);
        Some((from, to))
    }

    fn poll_reset(&mut self, config: &CircuitBreakerConfig, now: Instant) -> Option<Transition> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at))
                if now.saturating_duration_since(opened_at) >= config.reset_timeout =>
            {
                self.move_to(CircuitState::HalfOpen, now)
            }
            _ => None,
        }
    }
}

/// Outcome reported for a guarded call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// Circuit breaker guarding one dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    recorder: SharedRecorder,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.inner.lock().state)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new closed breaker
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            recorder: noop_recorder(),
        }
    }

    /// Attach a metrics recorder
    #[must_use]
    pub fn with_recorder(mut self, recorder: SharedRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// Dependency name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying a due Open → HalfOpen transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let now = Instant::now();
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.poll_reset(&self.config, now);
            (inner.state, transition)
        };
        self.emit(transition);
        state
    }

    /// Current counters
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        BreakerSnapshot {
            state,
            failure_count: inner.failure_count,
            half_open_successes: inner.half_open_successes,
            in_flight: inner.in_flight,
        }
    }

    /// Ask to make a call
    ///
    /// # Errors
    /// Returns `DependencyUnavailable` when the breaker is open, or half-open
    /// with every trial slot taken
    pub fn check(self: &Arc<Self>) -> GatewayResult<BreakerPermit> {
        let now = Instant::now();
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.poll_reset(&self.config, now);
            let result = match inner.state {
                CircuitState::Closed => Ok(inner.generation),
                CircuitState::Open => Err("circuit breaker is open"),
                CircuitState::HalfOpen => {
                    if inner.in_flight < self.config.half_open_max_in_flight {
                        inner.in_flight += 1;
                        Ok(inner.generation)
                    } else {
                        Err("circuit breaker is half-open, trial call in progress")
                    }
                }
            };
            (result, transition)
        };
        self.emit(transition);

        match result {
            Ok(generation) => Ok(BreakerPermit {
                breaker: Arc::clone(self),
                generation,
                resolved: false,
            }),
            Err(message) => {
                debug!(dependency = %self.name, "Circuit breaker rejected call");
                Err(GatewayError::dependency_unavailable(&self.name, message))
            }
        }
    }

    /// Run `f` under the breaker, classifying its error with
    /// [`GatewayError::counts_as_failure`]
    ///
    /// # Errors
    /// Returns `DependencyUnavailable` if the call was not permitted, otherwise
    /// the error produced by `f`
    pub async fn call<F, Fut, T>(self: &Arc<Self>, f: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let permit = self.check()?;
        let result = f().await;
        match &result {
            Ok(_) => permit.record_success(),
            Err(err) if err.counts_as_failure() => permit.record_failure(),
            Err(_) => permit.release(),
        }
        result
    }

    /// Feed a health probe result
    ///
    /// Only a closed breaker is affected: a failed probe counts as a failure, a
    /// successful one resets the failure count.
    pub fn record_probe(&self, healthy: bool) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            if inner.state != CircuitState::Closed {
                return;
            }
            if healthy {
                inner.failure_count = 0;
                None
            } else {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.move_to(CircuitState::Open, now)
                } else {
                    None
                }
            }
        };
        self.emit(transition);
    }

    /// Force the breaker open
    pub fn trip(&self) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            let transition = inner.move_to(CircuitState::Open, now);
            // Re-tripping an open breaker restarts its cool-down
            inner.opened_at = Some(now);
            transition
        };
        self.emit(transition);
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) {
        let now = Instant::now();
        let transition = self.inner.lock().move_to(CircuitState::Closed, now);
        self.emit(transition);
    }

    fn resolve(&self, generation: u64, outcome: Outcome) {
        let now = Instant::now();
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                // Outcome belongs to a state the breaker has already left
                return;
            }
            match inner.state {
                CircuitState::Closed => match outcome {
                    Outcome::Success => {
                        inner.failure_count = 0;
                        None
                    }
                    Outcome::Failure => {
                        inner.failure_count += 1;
                        if inner.failure_count >= self.config.failure_threshold {
                            inner.move_to(CircuitState::Open, now)
                        } else {
                            None
                        }
                    }
                    Outcome::Neutral => None,
                },
                CircuitState::HalfOpen => {
                    inner.in_flight = inner.in_flight.saturating_sub(1);
                    match outcome {
                        Outcome::Success => {
                            inner.half_open_successes += 1;
                            if inner.half_open_successes >= self.config.success_threshold {
                                inner.move_to(CircuitState::Closed, now)
                            } else {
                                None
                            }
                        }
                        Outcome::Failure => inner.move_to(CircuitState::Open, now),
                        Outcome::Neutral => None,
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.emit(transition);
    }

    fn emit(&self, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        self.recorder
            .record_breaker_transition(&self.name, from.as_str(), to.as_str());
        match to {
            CircuitState::Open => warn!(
                dependency = %self.name,
                from = %from,
                to = %to,
                reset_timeout_ms = self.config.reset_timeout.as_millis(),
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen | CircuitState::Closed => info!(
                dependency = %self.name,
                from = %from,
                to = %to,
                "Circuit breaker state changed"
            ),
        }
    }
}

/// Permission to make one call through a breaker
///
/// Report the outcome with [`record_success`](Self::record_success),
/// [`record_failure`](Self::record_failure) or [`release`](Self::release).
/// Dropping an unresolved permit records a failure.
#[must_use = "an unresolved permit counts as a failure when dropped"]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    resolved: bool,
}

impl fmt::Debug for BreakerPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("breaker", &self.breaker.name)
            .field("generation", &self.generation)
            .finish()
    }
}

impl BreakerPermit {
    /// The call succeeded
    pub fn record_success(mut self) {
        self.finish(Outcome::Success);
    }

    /// The call failed in a way that counts against the dependency
    pub fn record_failure(mut self) {
        self.finish(Outcome::Failure);
    }

    /// The call finished with an outcome that says nothing about the
    /// dependency's health (for example a rejected input)
    pub fn release(mut self) {
        self.finish(Outcome::Neutral);
    }

    fn finish(&mut self, outcome: Outcome) {
        if !self.resolved {
            self.resolved = true;
            self.breaker.resolve(self.generation, outcome);
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved {
            debug!(dependency = %self.breaker.name, "Breaker permit abandoned");
            self.finish(Outcome::Failure);
        }
    }
}

/// Shared breakers keyed by dependency name
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    recorder: SharedRecorder,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.len())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry using `defaults` for unknown dependencies
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
            recorder: noop_recorder(),
        }
    }

    /// Use `config` for the named dependency
    #[must_use]
    pub fn with_override(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(name.into(), config);
        self
    }

    /// Attach a metrics recorder handed to every breaker created afterwards
    #[must_use]
    pub fn with_recorder(mut self, recorder: SharedRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// Get or create the breaker for a dependency
    #[must_use]
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(&breaker);
        }
        let config = self.overrides.get(name).copied().unwrap_or(self.defaults);
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, config).with_recorder(Arc::clone(&self.recorder)))
            })
            .clone()
    }

    /// Get a breaker if it exists
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(&b))
    }

    /// Current state of every breaker
    #[must_use]
    pub fn all_states(&self) -> HashMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
