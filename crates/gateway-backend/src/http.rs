//! HTTP model backend.
//!
//! Speaks a small JSON protocol: `POST {endpoint}/v1/predict` with
//! `{"features", "parameters"}`, answered by `{"output", "probabilities"?}`,
//! and `GET {endpoint}{health_path}` for probes.

use async_trait::async_trait;
use gateway_core::{
    BackendOutput, GatewayError, GatewayResult, InferenceInput, ModelBackend, ModelIdentity,
};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// HTTP backend configuration
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Backend instance ID (breaker dependency name)
    pub id: String,
    /// Base URL
    pub endpoint: String,
    /// Served model
    pub model: ModelIdentity,
    /// Per-call timeout
    pub timeout: Duration,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Path used by health probes
    pub health_path: String,
    /// Optional bearer token
    pub api_key: Option<SecretString>,
}

impl HttpBackendConfig {
    /// Create a configuration with default timeouts
    #[must_use]
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, model: ModelIdentity) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            model,
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            health_path: "/health".to_string(),
            api_key: None,
        }
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the health probe path
    #[must_use]
    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    /// Set the bearer token
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(key.into()));
        self
    }
}

/// Model backend reached over HTTP
pub struct HttpModelBackend {
    config: HttpBackendConfig,
    client: Client,
}

impl std::fmt::Debug for HttpModelBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpModelBackend")
            .field("id", &self.config.id)
            .field("endpoint", &self.config.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpModelBackend {
    /// Create a new HTTP backend
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created
    pub fn new(config: HttpBackendConfig) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn predict_url(&self) -> String {
        format!("{}/v1/predict", self.config.endpoint.trim_end_matches('/'))
    }

    fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.health_path
        )
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    fn transport_error(&self, err: &reqwest::Error, timeout: Duration) -> GatewayError {
        if err.is_timeout() {
            GatewayError::timeout(timeout)
        } else {
            GatewayError::backend(
                &self.config.id,
                format!("Request failed: {err}"),
                None,
                true,
            )
        }
    }

    fn status_error(&self, status: StatusCode, body: String) -> GatewayError {
        GatewayError::backend(
            &self.config.id,
            if body.is_empty() {
                status.to_string()
            } else {
                body
            },
            Some(status.as_u16()),
            is_transient_status(status),
        )
    }
}

/// 408, 429 and 5xx are worth retrying; other failures are the caller's fault
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn model(&self) -> &ModelIdentity {
        &self.config.model
    }

    #[instrument(skip(self, input), fields(backend = %self.config.id, features = input.features.len()))]
    async fn predict(&self, input: &InferenceInput) -> GatewayResult<BackendOutput> {
        debug!("Sending prediction request");

        let response = self
            .authorize(self.client.post(self.predict_url()))
            .json(input)
            .send()
            .await
            .map_err(|e| self.transport_error(&e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_transient_status(status) {
                warn!(status = %status, error = %body, "Model backend error");
            } else {
                debug!(status = %status, error = %body, "Model backend rejected request");
            }
            return Err(self.status_error(status, body));
        }

        response.json::<BackendOutput>().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::timeout(self.config.timeout)
            } else {
                GatewayError::backend(
                    &self.config.id,
                    format!("Failed to parse response: {e}"),
                    None,
                    false,
                )
            }
        })
    }

    async fn health_check(&self) -> GatewayResult<()> {
        let response = self
            .authorize(self.client.get(self.health_url()))
            .send()
            .await
            .map_err(|e| self.transport_error(&e, self.config.timeout))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            // Any unhealthy answer is a dependency failure, whatever its class
            Err(GatewayError::backend(
                &self.config.id,
                format!("health check returned {status}"),
                Some(status.as_u16()),
                true,
            ))
        }
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(endpoint: &str) -> HttpModelBackend {
        let config = HttpBackendConfig::new(
            "model_backend",
            endpoint,
            ModelIdentity::new("iris", "1.0.0"),
        );
        HttpModelBackend::new(config).unwrap()
    }

    #[test]
    fn test_urls() {
        let backend = backend("http://models:8000/");
        assert_eq!(backend.predict_url(), "http://models:8000/v1/predict");
        assert_eq!(backend.health_url(), "http://models:8000/health");
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
        assert!(!is_transient_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn test_status_error_classification() {
        let backend = backend("http://models:8000");

        let err = backend.status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad shape".into());
        assert_eq!(err.status_code(), 502);
        assert!(!err.is_transient());
        assert!(!err.counts_as_failure());

        let err = backend.status_error(StatusCode::BAD_GATEWAY, String::new());
        assert!(err.is_transient());
        assert!(err.counts_as_failure());
    }

    #[test]
    fn test_debug_hides_api_key() {
        let config = HttpBackendConfig::new(
            "model_backend",
            "http://models:8000",
            ModelIdentity::new("iris", "1.0.0"),
        )
        .with_api_key("super-secret");
        let backend = HttpModelBackend::new(config).unwrap();
        assert!(!format!("{backend:?}").contains("super-secret"));
    }
}
