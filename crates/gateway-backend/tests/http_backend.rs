//! HTTP backend tests against a mock model server.

use gateway_backend::{HttpBackendConfig, HttpModelBackend};
use gateway_core::{GatewayError, InferenceInput, ModelBackend, ModelIdentity, Parameters};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn backend_for(server: &MockServer) -> HttpModelBackend {
    let config = HttpBackendConfig::new(
        "model_backend",
        server.uri(),
        ModelIdentity::new("iris", "1.0.0"),
    )
    .with_timeout(Duration::from_millis(500));
    HttpModelBackend::new(config).unwrap()
}

fn input() -> InferenceInput {
    InferenceInput::new(vec![1.0, 2.0, 3.0, 4.0], Parameters::new())
}

#[tokio::test]
async fn test_predict_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/predict"))
        .and(body_json(json!({"features": [1.0, 2.0, 3.0, 4.0], "parameters": {}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": "setosa",
            "probabilities": [0.9, 0.05, 0.05]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let output = backend_for(&server).predict(&input()).await.unwrap();
    assert_eq!(output.output, json!("setosa"));
    assert_eq!(output.probabilities, Some(vec![0.9, 0.05, 0.05]));
}

#[tokio::test]
async fn test_bearer_token_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/predict"))
        .and(header("authorization", "Bearer backend-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let config = HttpBackendConfig::new(
        "model_backend",
        server.uri(),
        ModelIdentity::new("iris", "1.0.0"),
    )
    .with_api_key("backend-token");
    let backend = HttpModelBackend::new(config).unwrap();

    let output = backend.predict(&input()).await.unwrap();
    assert_eq!(output.output, json!(1));
    assert!(output.probabilities.is_none());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = backend_for(&server).predict(&input()).await.unwrap_err();
    match &err {
        GatewayError::Backend {
            status_code,
            transient,
            message,
            ..
        } => {
            assert_eq!(*status_code, Some(503));
            assert!(*transient);
            assert_eq!(message, "overloaded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.counts_as_failure());
}

#[tokio::test]
async fn test_client_error_not_counted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("wrong feature count"))
        .mount(&server)
        .await;

    let err = backend_for(&server).predict(&input()).await.unwrap_err();
    assert!(!err.is_transient());
    assert!(!err.counts_as_failure());
    assert_eq!(err.status_code(), 502);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"output": 1}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = backend_for(&server).predict(&input()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_malformed_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let err = backend_for(&server).predict(&input()).await.unwrap_err();
    assert!(!err.is_transient());
    assert!(err.counts_as_failure());
}

#[tokio::test]
async fn test_health_check() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert!(backend_for(&server).health_check().await.is_ok());
}

#[tokio::test]
async fn test_health_check_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ready"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = HttpBackendConfig::new(
        "model_backend",
        server.uri(),
        ModelIdentity::new("iris", "1.0.0"),
    )
    .with_health_path("/ready");
    let backend = HttpModelBackend::new(config).unwrap();

    let err = backend.health_check().await.unwrap_err();
    assert!(err.counts_as_failure());
}

#[tokio::test]
async fn test_unreachable_backend_is_transient() {
    let config = HttpBackendConfig::new(
        "model_backend",
        "http://127.0.0.1:1",
        ModelIdentity::new("iris", "1.0.0"),
    );
    let backend = HttpModelBackend::new(config).unwrap();

    let err = backend.predict(&input()).await.unwrap_err();
    assert!(err.is_transient());
}
