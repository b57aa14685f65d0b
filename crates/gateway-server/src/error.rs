//! API error handling.
//!
//! Every failure leaves the server as the same envelope:
//! `{"error": {"code", "message", "details", "request_id"}}`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::{ErrorEnvelope, GatewayError};
use tracing::{error, warn};

/// API error wrapper
#[derive(Debug)]
pub struct ApiError {
    /// Underlying gateway error
    pub error: GatewayError,
    /// Request the error belongs to
    pub request_id: Option<String>,
}

impl ApiError {
    /// Wrap a gateway error
    #[must_use]
    pub fn new(error: GatewayError) -> Self {
        Self {
            error,
            request_id: None,
        }
    }

    /// Attach the request id
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Bad request error
    pub fn bad_request(message: impl Into<String>, code: &str) -> Self {
        Self::new(GatewayError::validation(message, None, code))
    }

    /// Forbidden error
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(GatewayError::authorization(message))
    }

    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.error.status_code()
    }

    /// Body sent to the caller
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        let request_id = self
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        ErrorEnvelope::from_error(&self.error, request_id)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.envelope();

        if status.is_server_error() {
            error!(
                status = %status.as_u16(),
                code = %body.error.code,
                request_id = %body.error.request_id,
                error = %self.error,
                "API error response"
            );
        } else {
            warn!(
                status = %status.as_u16(),
                code = %body.error.code,
                request_id = %body.error.request_id,
                message = %body.error.message,
                "API error response"
            );
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.error.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self::new(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request(format!("Invalid JSON: {err}"), "invalid_json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_validation_envelope() {
        let err = ApiError::bad_request("features must not be empty", "empty_features")
            .with_request_id("req-1");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "empty_features");
        assert_eq!(body["error"]["request_id"], "req-1");
        assert_eq!(body["error"]["message"], "features must not be empty");
    }

    #[tokio::test]
    async fn test_rate_limit_sets_retry_after() {
        let err = ApiError::from(GatewayError::rate_limited(Duration::from_millis(2100)));
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "rate_limit_exceeded");
        assert_eq!(body["error"]["details"]["retry_after_seconds"], 3);
    }

    #[tokio::test]
    async fn test_internal_error_is_generic() {
        let err = ApiError::from(GatewayError::internal("lock poisoned in pipeline"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "internal_error");
        assert_eq!(body["error"]["message"], "An unexpected error occurred");
        assert!(body["error"]["request_id"].is_string());
    }

    #[test]
    fn test_breaker_open_is_unavailable() {
        let err = ApiError::from(GatewayError::dependency_unavailable(
            "model_backend",
            "circuit breaker is open",
        ));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.envelope().error.code, "service_unavailable");
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = ApiError::from(json_err);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error.error_code(), "invalid_json");
    }
}
