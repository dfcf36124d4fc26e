//! HttpProviderAdapter Tests
//!
//! Uses wiremock to verify request shape, response parsing, and the
//! status-code classification that feeds the retry coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Notify;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pq_common::{GenerationSubmission, GuidanceParams, RequestStatus};
use pq_dispatch::{
    AdmissionConfig, AdmissionController, BreakerConfig, HttpProviderAdapter, HttpProviderConfig,
    NoOpHooks, ProviderAdapter, ProviderDispatcher, ProviderError, ProviderRuntime, RequestQueue,
    RetryCoordinator, RetryPolicy, UnmeteredCreditGate,
};

fn adapter_for(server: &MockServer) -> HttpProviderAdapter {
    HttpProviderAdapter::new(HttpProviderConfig {
        name: "flux".to_string(),
        endpoint: format!("{}/v1/generate", server.uri()),
        api_key: Some("test-key".to_string()),
        timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(2),
    })
    .unwrap()
}

fn guidance() -> GuidanceParams {
    GuidanceParams {
        width: Some(512),
        height: Some(512),
        ..Default::default()
    }
}

#[tokio::test]
async fn success_parses_image_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({"prompt": "a red fox", "width": 512})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "imageUrl": "https://cdn.example.com/out/42.png"
        })))
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let image = adapter.generate("a red fox", &guidance()).await.unwrap();
    assert_eq!(image.url, "https://cdn.example.com/out/42.png");
    assert_eq!(image.provider, "flux");
}

#[tokio::test]
async fn success_accepts_url_alias() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "url": "https://cdn.example.com/out/43.png"
        })))
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let image = adapter.generate("a red fox", &guidance()).await.unwrap();
    assert_eq!(image.url, "https://cdn.example.com/out/43.png");
}

#[tokio::test]
async fn server_errors_classify_as_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let err = adapter.generate("a red fox", &guidance()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Server { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn rate_limit_respects_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let err = adapter.generate("a red fox", &guidance()).await.unwrap_err();
    assert!(matches!(
        err,
        ProviderError::RateLimited {
            retry_after_secs: 7
        }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn refusals_classify_as_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(422).set_body_string("prompt violates content policy"),
        )
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let err = adapter.generate("a red fox", &guidance()).await.unwrap_err();
    match &err {
        ProviderError::Rejected(message) => {
            assert!(message.contains("content policy"));
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn auth_and_quota_classify_as_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(402))
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);

    let err = adapter.generate("a red fox", &guidance()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Auth(401)));

    let err = adapter.generate("a red fox", &guidance()).await.unwrap_err();
    assert!(matches!(err, ProviderError::QuotaExhausted));
}

#[tokio::test]
async fn garbage_success_body_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let adapter = adapter_for(&server);
    let err = adapter.generate("a red fox", &guidance()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Malformed(_)));
}

/// End to end: a provider that fails twice with 503 then succeeds, behind the
/// real dispatcher and retry coordinator.
#[tokio::test]
async fn dispatcher_retries_through_http_adapter() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "imageUrl": "https://cdn.example.com/out/ok.png"
        })))
        .mount(&server)
        .await;

    let notify = Arc::new(Notify::new());
    let queue = Arc::new(RequestQueue::new(10, Duration::from_secs(60)));
    let retry = Arc::new(RetryCoordinator::new(
        queue.clone(),
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
        },
        notify.clone(),
    ));
    let dispatcher = Arc::new(ProviderDispatcher::new(
        queue.clone(),
        retry,
        Arc::new(NoOpHooks),
        vec![ProviderRuntime {
            name: "flux".to_string(),
            adapter: Arc::new(adapter_for(&server)),
            limit: 2,
            timeout: Duration::from_secs(5),
            rate_limit_per_minute: None,
        }],
        BreakerConfig::default(),
        notify,
    ));
    dispatcher.start();

    let admission = Arc::new(AdmissionController::new(
        queue.clone(),
        dispatcher,
        Arc::new(UnmeteredCreditGate),
        AdmissionConfig::default(),
    ));

    let id = admission
        .accept(GenerationSubmission {
            user_id: "user-1".to_string(),
            prompt: "a red fox".to_string(),
            providers: vec!["flux".to_string()],
            guidance: guidance(),
        })
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(request) = queue.get(id) {
            if request.is_terminal() {
                assert_eq!(request.status, RequestStatus::Completed);
                assert_eq!(request.attempts, 3);
                assert_eq!(
                    request.image.unwrap().url,
                    "https://cdn.example.com/out/ok.png"
                );
                break;
            }
        }
        assert!(Instant::now() < deadline, "request never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
