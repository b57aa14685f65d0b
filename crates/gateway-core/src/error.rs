//! Error types and handling for the gateway.
//!
//! Every failure the request path can produce is a [`GatewayError`]. The
//! variants map onto HTTP status codes and onto the structured error envelope
//! returned to clients, and they carry enough classification for the retry
//! policy and the circuit breaker to decide what to do with them.

use crate::types::InputError;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using `GatewayError`
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Message returned to callers for internal failures
pub const INTERNAL_ERROR_MESSAGE: &str = "An unexpected error occurred";

/// Gateway error type covering all error scenarios
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Client input was malformed
    #[error("Validation error: {message}")]
    Validation {
        /// Error message
        message: String,
        /// Field that failed validation (if applicable)
        field: Option<String>,
        /// Error code for programmatic handling
        code: String,
    },

    /// Caller lacks the permission level for the operation
    #[error("Permission denied: {message}")]
    Authorization {
        /// Error message
        message: String,
    },

    /// Quota exceeded
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// Time until the request would be admitted
        retry_after: Duration,
    },

    /// Dependency is unusable (breaker open or retries exhausted)
    #[error("Dependency unavailable: {dependency} - {message}")]
    DependencyUnavailable {
        /// Dependency name
        dependency: String,
        /// Error message
        message: String,
    },

    /// Explicit failure reported by, or while talking to, a backend
    #[error("Backend error: {dependency} - {message}")]
    Backend {
        /// Dependency name
        dependency: String,
        /// Error message
        message: String,
        /// HTTP status code returned by the backend (if any)
        status_code: Option<u16>,
        /// Whether a retry may succeed
        transient: bool,
    },

    /// Deadline exceeded
    #[error("Request timeout after {duration:?}")]
    Timeout {
        /// Duration after which the operation timed out
        duration: Duration,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Unexpected internal failure
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    /// Get the HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::DependencyUnavailable { .. } | Self::Timeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Backend { transient, .. } => {
                if *transient {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            Self::Configuration { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether retrying the same call may succeed
    ///
    /// Only timeouts and transient backend failures (transport errors, 5xx,
    /// 408, 429) qualify. An open breaker is not retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Backend { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether this outcome counts against a dependency's circuit breaker
    ///
    /// Transport errors, timeouts and explicit backend failures count. A 4xx
    /// rejection of the caller's input does not.
    #[must_use]
    pub fn counts_as_failure(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Backend {
                status_code,
                transient,
                ..
            } => *transient || !matches!(status_code, Some(400..=499)),
            _ => false,
        }
    }

    /// Get the error code for programmatic handling
    #[must_use]
    pub fn error_code(&self) -> &str {
        match self {
            Self::Validation { code, .. } => code,
            Self::Authorization { .. } => "permission_denied",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::DependencyUnavailable { .. } => "service_unavailable",
            Self::Backend { transient, .. } => {
                if *transient {
                    "service_unavailable"
                } else {
                    "bad_gateway"
                }
            }
            Self::Timeout { .. } => "timeout",
            Self::Configuration { .. } | Self::Internal { .. } => "internal_error",
        }
    }

    /// Message safe to show to the caller
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Configuration { .. } | Self::Internal { .. } => {
                INTERNAL_ERROR_MESSAGE.to_string()
            }
            Self::Validation { message, .. } | Self::Authorization { message } => message.clone(),
            Self::RateLimited { .. } => "Rate limit exceeded".to_string(),
            Self::DependencyUnavailable { dependency, .. } => {
                format!("Service temporarily unavailable: {dependency}")
            }
            Self::Backend {
                dependency,
                transient,
                ..
            } => {
                if *transient {
                    format!("Service temporarily unavailable: {dependency}")
                } else {
                    format!("Upstream {dependency} rejected the request")
                }
            }
            Self::Timeout { duration } => {
                format!("Request timed out after {}ms", duration.as_millis())
            }
        }
    }

    /// Structured details for the error envelope
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Validation {
                field: Some(field), ..
            } => Some(json!({ "field": field })),
            Self::RateLimited { .. } => {
                Some(json!({ "retry_after_seconds": self.retry_after_secs() }))
            }
            Self::DependencyUnavailable { dependency, .. } => {
                Some(json!({ "dependency": dependency }))
            }
            Self::Backend {
                dependency,
                status_code,
                ..
            } => Some(json!({ "dependency": dependency, "status_code": status_code })),
            Self::Timeout { duration } => {
                Some(json!({ "timeout_ms": u64::try_from(duration.as_millis()).unwrap_or(u64::MAX) }))
            }
            _ => None,
        }
    }

    /// Whole seconds a rate-limited caller should wait (rounded up, at least 1)
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs_f64().ceil();
                // Non-negative and finite by construction of Duration
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Some((secs as u64).max(1))
            }
            _ => None,
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(
        message: impl Into<String>,
        field: Option<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::Validation {
            message: message.into(),
            field,
            code: code.into(),
        }
    }

    /// Create an authorization error
    #[must_use]
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// Create a rate limit error
    #[must_use]
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Create a dependency unavailable error
    #[must_use]
    pub fn dependency_unavailable(
        dependency: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::DependencyUnavailable {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// Create a backend error
    #[must_use]
    pub fn backend(
        dependency: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
        transient: bool,
    ) -> Self {
        Self::Backend {
            dependency: dependency.into(),
            message: message.into(),
            status_code,
            transient,
        }
    }

    /// Create a timeout error
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<InputError> for GatewayError {
    fn from(err: InputError) -> Self {
        let (field, code) = match &err {
            InputError::EmptyFeatures { .. } => ("features", "empty_features"),
            InputError::TooManyFeatures { .. } => ("features", "too_many_features"),
            InputError::NonFiniteValue { .. } => ("features", "non_finite_feature"),
            InputError::EmptyBatch => ("inputs", "empty_batch"),
            InputError::BatchTooLarge { .. } => ("inputs", "batch_too_large"),
            InputError::InconsistentLength { .. } => ("features", "inconsistent_feature_length"),
        };
        Self::Validation {
            message: err.to_string(),
            field: Some(field.to_string()),
            code: code.to_string(),
        }
    }
}

/// Error envelope returned to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error body
    pub error: ErrorBody,
}

/// Body of the error envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Structured details
    pub details: Option<Value>,
    /// Correlation id of the failed request
    pub request_id: String,
}

impl ErrorEnvelope {
    /// Build the envelope for an error raised while serving `request_id`
    #[must_use]
    pub fn from_error(err: &GatewayError, request_id: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: err.error_code().to_string(),
                message: err.public_message(),
                details: err.details(),
                request_id: request_id.into(),
            },
        }
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error.code, self.error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::validation("test", None, "test_code").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::rate_limited(Duration::from_secs(3)).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::dependency_unavailable("model_backend", "open").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::timeout(Duration::from_secs(1)).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::backend("model_backend", "bad input", Some(422), false).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::timeout(Duration::from_millis(10)).is_transient());
        assert!(GatewayError::backend("m", "oops", Some(503), true).is_transient());
        assert!(!GatewayError::backend("m", "bad", Some(400), false).is_transient());
        assert!(!GatewayError::dependency_unavailable("m", "open").is_transient());
        assert!(!GatewayError::validation("bad", None, "x").is_transient());
    }

    #[test]
    fn test_breaker_failure_classification() {
        assert!(GatewayError::timeout(Duration::from_millis(10)).counts_as_failure());
        assert!(GatewayError::backend("m", "oops", Some(500), true).counts_as_failure());
        assert!(GatewayError::backend("m", "garbled body", None, false).counts_as_failure());
        assert!(!GatewayError::backend("m", "bad input", Some(400), false).counts_as_failure());
        assert!(!GatewayError::validation("bad", None, "x").counts_as_failure());
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let err = GatewayError::rate_limited(Duration::from_millis(2_100));
        assert_eq!(err.retry_after_secs(), Some(3));

        let err = GatewayError::rate_limited(Duration::from_millis(10));
        assert_eq!(err.retry_after_secs(), Some(1));
    }

    #[test]
    fn test_internal_message_is_generic() {
        let err = GatewayError::internal("db pool poisoned at worker 3");
        let envelope = ErrorEnvelope::from_error(&err, "req-1");

        assert_eq!(envelope.error.code, "internal_error");
        assert_eq!(envelope.error.message, INTERNAL_ERROR_MESSAGE);
        assert_eq!(envelope.error.request_id, "req-1");
    }

    #[test]
    fn test_envelope_shape() {
        let err = GatewayError::validation(
            "features must not be empty",
            Some("features".to_string()),
            "empty_features",
        );
        let value = serde_json::to_value(ErrorEnvelope::from_error(&err, "abc")).unwrap();

        assert_eq!(value["error"]["code"], "empty_features");
        assert_eq!(value["error"]["details"]["field"], "features");
        assert_eq!(value["error"]["request_id"], "abc");
    }

    #[test]
    fn test_input_error_conversion() {
        let err: GatewayError = InputError::BatchTooLarge { len: 300, max: 100 }.into();
        assert_eq!(err.error_code(), "batch_too_large");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
