//! HTTP request handlers.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::{BatchPredictionRequest, GatewayError, PredictionRequest};
use gateway_health::HealthStatus;
use gateway_resilience::Quota;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::error::ApiError;
use crate::extractors::{CallerContext, JsonBody, RequestId};
use crate::routes::{BATCH_PREDICT_ROUTE, PREDICT_ROUTE};
use crate::state::AppState;

const RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Cache invalidation response
#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    /// Number of cache entries removed
    pub invalidated: usize,
}

/// Single or multi-row prediction
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn predict(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    caller: CallerContext,
    JsonBody(body): JsonBody<PredictionRequest>,
) -> Result<Response, ApiError> {
    let keys = caller.rate_limit_keys(PREDICT_ROUTE, state.gateway.is_sensitive(PREDICT_ROUTE));
    let quota = state
        .gateway
        .admit(&keys, 1)
        .map_err(|e| with_request_id(e, &request_id))?;

    let response = state
        .gateway
        .predict(&body)
        .await
        .map_err(|e| with_request_id(e, &request_id))?;

    debug!(
        predictions = response.predictions.len(),
        processing_time_ms = response.processing_time_ms,
        "Prediction served"
    );

    let mut response = Json(response).into_response();
    quota_headers(response.headers_mut(), &quota);
    Ok(response)
}

/// Batch prediction with per-item results
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn batch_predict(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    caller: CallerContext,
    JsonBody(body): JsonBody<BatchPredictionRequest>,
) -> Result<Response, ApiError> {
    let keys = caller.rate_limit_keys(
        BATCH_PREDICT_ROUTE,
        state.gateway.is_sensitive(BATCH_PREDICT_ROUTE),
    );
    let cost = state.gateway.batch_cost(body.inputs.len());
    let quota = state
        .gateway
        .admit(&keys, cost)
        .map_err(|e| with_request_id(e, &request_id))?;

    let response = state
        .gateway
        .batch_predict(&body)
        .await
        .map_err(|e| with_request_id(e, &request_id))?;

    debug!(
        succeeded = response.succeeded,
        failed = response.failed,
        cost,
        "Batch served"
    );

    let mut response = Json(response).into_response();
    quota_headers(response.headers_mut(), &quota);
    Ok(response)
}

/// Remove cached predictions for the given input; admin only
#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn invalidate_cache(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    caller: CallerContext,
    JsonBody(body): JsonBody<PredictionRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    if !caller.is_admin() {
        return Err(ApiError::forbidden("Admin permission required").with_request_id(request_id));
    }

    let invalidated = state
        .gateway
        .invalidate(&body)
        .await
        .map_err(|e| with_request_id(e, &request_id))?;

    info!(invalidated, "Cache entries invalidated");
    Ok(Json(InvalidateResponse { invalidated }))
}

/// Detailed health endpoint
pub async fn health_check(State(state): State<AppState>) -> Response {
    state.health.refresh_if_stale().await;
    let health = state.health.detailed();
    let status = if health.status == HealthStatus::Unavailable {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(health)).into_response()
}

/// Liveness check endpoint
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let report = state.health.liveness();
    (probe_status(report.is_healthy()), Json(report)).into_response()
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let report = state.health.readiness();
    (probe_status(report.is_healthy()), Json(report)).into_response()
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.gather(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

fn probe_status(healthy: bool) -> StatusCode {
    if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

fn with_request_id(err: GatewayError, request_id: &str) -> ApiError {
    ApiError::from(err).with_request_id(request_id)
}

/// Quota headers; omitted when rate limiting is disabled
fn quota_headers(headers: &mut HeaderMap, quota: &Quota) {
    if quota.limit == 0 {
        return;
    }
    let reset_secs = quota.reset_after.as_secs_f64().ceil();
    headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(quota.remaining));
    if let Ok(value) = HeaderValue::from_str(&format!("{reset_secs:.0}")) {
        headers.insert(RATE_LIMIT_RESET, value);
    }
}
