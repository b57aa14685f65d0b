//! Route table and middleware stack.

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers;
use crate::middleware::{
    cors_layer, logging_middleware, metrics_middleware, request_id_middleware,
    response_time_middleware, security_headers_middleware,
};
use crate::state::AppState;

/// Single prediction route
pub const PREDICT_ROUTE: &str = "/predict";
/// Batch prediction route
pub const BATCH_PREDICT_ROUTE: &str = "/batch-predict";
/// Detailed health route
pub const HEALTH_ROUTE: &str = "/health";
/// Liveness probe route
pub const LIVENESS_ROUTE: &str = "/health/liveness";
/// Readiness probe route
pub const READINESS_ROUTE: &str = "/health/readiness";
/// Cache invalidation route
pub const INVALIDATE_ROUTE: &str = "/admin/cache/invalidate";

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let config = &state.config;

    let mut router = Router::new()
        .route(PREDICT_ROUTE, post(handlers::predict))
        .route(BATCH_PREDICT_ROUTE, post(handlers::batch_predict))
        .route(HEALTH_ROUTE, get(handlers::health_check))
        .route(LIVENESS_ROUTE, get(handlers::liveness_check))
        .route(READINESS_ROUTE, get(handlers::readiness_check))
        .route(INVALIDATE_ROUTE, post(handlers::invalidate_cache));

    if config.observability.metrics.enabled {
        router = router.route(
            &config.observability.metrics.endpoint,
            get(handlers::metrics_endpoint),
        );
    }

    // Layers run bottom-up: the request id is assigned before anything logs
    let mut router = router
        .route_layer(from_fn_with_state(state.clone(), metrics_middleware))
        .layer(RequestBodyLimitLayer::new(config.server.max_request_body_size))
        .layer(from_fn(security_headers_middleware))
        .layer(from_fn(response_time_middleware))
        .layer(from_fn(logging_middleware))
        .layer(from_fn(request_id_middleware));

    if config.server.cors.enabled {
        router = router.layer(cors_layer(&config.server.cors));
    }

    router.with_state(state)
}
