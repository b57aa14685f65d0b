//! Prediction pipeline.
//!
//! Admission, validation, cache lookup and the breaker-guarded backend call
//! with retries, all bounded by the request deadline.

use futures::stream::{self, StreamExt};
use gateway_core::{
    noop_recorder, BackendOutput, BatchItemResult, BatchPredictionRequest,
    BatchPredictionResponse, GatewayError, GatewayResult, InferenceInput, InputLimits,
    ModelBackend, ModelIdentity, Prediction, PredictionRequest, PredictionResponse,
    SharedRecorder,
};
use gateway_resilience::{
    with_timeout, Admission, CacheClient, CacheKey, CircuitBreaker, Deadline, Quota,
    RateLimitKey, RateLimiter, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Knobs for the prediction pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Deadline for the whole request
    pub request_timeout: Duration,
    /// Batch items in flight at once
    pub batch_concurrency: usize,
    /// Cache TTL for `/predict` results
    pub predict_ttl: Duration,
    /// Cache TTL for `/batch-predict` results
    pub batch_ttl: Duration,
    /// Input size bounds
    pub limits: InputLimits,
    /// Rate-limit tokens charged per batch item
    pub batch_item_cost: f64,
    /// Routes charged against an extra route-class bucket
    pub sensitive_routes: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            batch_concurrency: 8,
            predict_ttl: Duration::from_secs(300),
            batch_ttl: Duration::from_secs(300),
            limits: InputLimits::default(),
            batch_item_cost: 0.1,
            sensitive_routes: vec!["/batch-predict".to_string()],
        }
    }
}

/// Orchestrates a prediction across limiter, cache and backend
pub struct PredictionGateway {
    backend: Arc<dyn ModelBackend>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<CacheClient>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    settings: PipelineSettings,
    recorder: SharedRecorder,
}

impl PredictionGateway {
    /// Create a gateway with default settings and retry policy
    #[must_use]
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<CacheClient>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            backend,
            breaker,
            cache,
            limiter,
            retry: RetryPolicy::default(),
            settings: PipelineSettings::default(),
            recorder: noop_recorder(),
        }
    }

    /// Set the retry policy for backend calls
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set pipeline settings
    #[must_use]
    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the metrics recorder
    #[must_use]
    pub fn with_recorder(mut self, recorder: SharedRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// Model served by the backend
    #[must_use]
    pub fn model(&self) -> &ModelIdentity {
        self.backend.model()
    }

    /// Breaker guarding the backend
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Prediction cache
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheClient> {
        &self.cache
    }

    /// Pipeline settings
    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Whether `route` is charged against a route-class bucket
    #[must_use]
    pub fn is_sensitive(&self, route: &str) -> bool {
        self.settings.sensitive_routes.iter().any(|r| r == route)
    }

    /// Rate-limit cost of a batch of `items`
    ///
    /// `max(1, ceil(n * batch_item_cost))` with `n` clamped to the batch size
    /// bound.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn batch_cost(&self, items: usize) -> u32 {
        let n = items.min(self.settings.limits.max_batch_size) as f64;
        let cost = (n * self.settings.batch_item_cost.max(0.0)).ceil() as u32;
        cost.max(1)
    }

    /// Charge `cost` tokens to every key
    ///
    /// # Errors
    /// Returns `RateLimited` carrying the longest wait among denied buckets
    pub fn admit(&self, keys: &[RateLimitKey], cost: u32) -> GatewayResult<Quota> {
        match self.limiter.admit_all(keys, cost) {
            Admission::Allowed(quota) => Ok(quota),
            Admission::Denied { retry_after } => Err(GatewayError::rate_limited(retry_after)),
        }
    }

    /// Serve a `/predict` request
    ///
    /// All rows must succeed; the first failure fails the request.
    ///
    /// # Errors
    /// Returns `Validation` for malformed input, `Timeout` when the request
    /// deadline passes, or the backend failure after retries
    #[instrument(skip_all, fields(rows = request.features.len()))]
    pub async fn predict(&self, request: &PredictionRequest) -> GatewayResult<PredictionResponse> {
        let start = Instant::now();
        request.validate(&self.settings.limits)?;

        let deadline = Deadline::after(self.settings.request_timeout);
        let inputs = request.to_inputs();
        let ttl = self.settings.predict_ttl;

        let predictions = deadline
            .run(async {
                let results: Vec<GatewayResult<Prediction>> = stream::iter(inputs)
                    .map(|input| async move { self.predict_one(&input, ttl).await })
                    .buffered(self.settings.batch_concurrency.max(1))
                    .collect()
                    .await;
                results.into_iter().collect::<GatewayResult<Vec<_>>>()
            })
            .await?;

        let model = self.model();
        Ok(PredictionResponse {
            predictions,
            model_version: model.version.clone(),
            model_name: model.name.clone(),
            processing_time_ms: elapsed_ms(start),
        })
    }

    /// Serve a `/batch-predict` request
    ///
    /// Items run independently; failures are reported per item.
    ///
    /// # Errors
    /// Returns `Validation` if the batch itself is malformed
    #[instrument(skip_all, fields(items = request.inputs.len()))]
    pub async fn batch_predict(
        &self,
        request: &BatchPredictionRequest,
    ) -> GatewayResult<BatchPredictionResponse> {
        let start = Instant::now();
        request.validate(&self.settings.limits)?;

        let deadline = Deadline::after(self.settings.request_timeout);
        let inputs = request.to_inputs();
        let ttl = self.settings.batch_ttl;

        let results: Vec<BatchItemResult> = stream::iter(inputs.into_iter().enumerate())
            .map(|(index, input)| async move {
                match deadline.run(self.predict_one(&input, ttl)).await {
                    Ok(prediction) => BatchItemResult::ok(index, prediction),
                    Err(err) => {
                        debug!(index, error = %err, "Batch item failed");
                        BatchItemResult::failed(index, err.error_code(), err.public_message())
                    }
                }
            })
            .buffered(self.settings.batch_concurrency.max(1))
            .collect()
            .await;

        let succeeded = results.iter().filter(|r| r.prediction.is_some()).count();
        let failed = results.len() - succeeded;
        let model = self.model();

        Ok(BatchPredictionResponse {
            results,
            model_name: model.name.clone(),
            model_version: model.version.clone(),
            processing_time_ms: elapsed_ms(start),
            succeeded,
            failed,
        })
    }

    /// Remove cached predictions for every row of `request`
    ///
    /// # Errors
    /// Returns `Validation` for malformed input or `DependencyUnavailable` if
    /// the cache cannot be reached
    pub async fn invalidate(&self, request: &PredictionRequest) -> GatewayResult<usize> {
        request.validate(&self.settings.limits)?;

        let mut removed = 0;
        for input in request.to_inputs() {
            let key = CacheKey::for_input(self.model(), &input);
            if self.cache.invalidate(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn predict_one(&self, input: &InferenceInput, ttl: Duration) -> GatewayResult<Prediction> {
        let key = CacheKey::for_input(self.model(), input);
        if let Some(prediction) = self.cache.get::<Prediction>(&key).await {
            return Ok(prediction);
        }

        let output = self.call_backend(input).await?;
        let prediction = Prediction::from_output(output, input.return_probability());
        self.cache.set(&key, &prediction, ttl).await;
        Ok(prediction)
    }

    async fn call_backend(&self, input: &InferenceInput) -> GatewayResult<BackendOutput> {
        let backend = &self.backend;
        self.retry
            .execute(|attempt| async move {
                let start = Instant::now();
                let result = self
                    .breaker
                    .call(|| with_timeout(backend.timeout(), backend.predict(input)))
                    .await;

                let rejected = matches!(result, Err(GatewayError::DependencyUnavailable { .. }));
                if !rejected {
                    self.recorder
                        .observe_backend_call(backend.id(), start.elapsed(), result.is_ok());
                }
                if let Err(err) = &result {
                    debug!(attempt, dependency = backend.id(), error = %err, "Backend call failed");
                }
                result
            })
            .await
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000.0
}
