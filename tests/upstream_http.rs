//! Upstream failure classification against a real HTTP server (mockito),
//! and the executor retrying real requests.

use speech_gateway::executor::Executor;
use speech_gateway::metrics::{MetricsAggregator, MetricsConfig};
use speech_gateway::resilience::circuit_breaker::CircuitBreakerConfig;
use speech_gateway::resilience::retry::RetryConfig;
use speech_gateway::resilience::watchdog::WatchdogConfig;
use speech_gateway::{ErrorKind, OpClass, StandardErrorCode, UpstreamError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn call(url: String) -> Result<String, UpstreamError> {
    let resp = reqwest::Client::new().post(url).send().await?;
    let resp = UpstreamError::check_response(resp).await?;
    Ok(resp.text().await?)
}

fn fast_executor(max_attempts: u32) -> Executor {
    Executor::standalone(
        CircuitBreakerConfig::new(),
        RetryConfig::new()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20))
            .with_jitter(false),
        &WatchdogConfig::new().with_timeout(Duration::from_secs(5)),
        Arc::new(MetricsAggregator::new(&MetricsConfig::new())),
    )
}

#[tokio::test]
async fn test_rate_limited_response_carries_retry_after() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/v1/text-to-speech")
        .with_status(429)
        .with_header("retry-after", "2")
        .with_body(r#"{"detail":{"status":"too_many_concurrent_requests","message":"slow down"}}"#)
        .create_async()
        .await;

    let err = call(format!("{}/v1/text-to-speech", server.url()))
        .await
        .unwrap_err();
    assert_eq!(err.code, StandardErrorCode::RateLimited);
    assert_eq!(err.status, Some(429));
    assert_eq!(err.retry_after_ms, Some(2000));
    assert!(err.retryable());
}

#[tokio::test]
async fn test_provider_code_in_body_wins_over_status() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
        .mock("POST", "/v1/speech-to-text")
        .with_status(400)
        .with_body(r#"{"detail":{"status":"quota_exceeded"}}"#)
        .create_async()
        .await;

    let err = call(format!("{}/v1/speech-to-text", server.url()))
        .await
        .unwrap_err();
    assert_eq!(err.code, StandardErrorCode::QuotaExhausted);
    assert!(!err.retryable());
}

#[tokio::test]
async fn test_executor_retries_server_errors_until_success() {
    let mut server = mockito::Server::new_async().await;
    let fail = server
        .mock("POST", "/flaky/fail")
        .with_status(503)
        .with_body("overloaded")
        .expect(2)
        .create_async()
        .await;
    let ok = server
        .mock("POST", "/flaky/ok")
        .with_status(200)
        .with_body("audio-bytes")
        .expect(1)
        .create_async()
        .await;

    let executor = fast_executor(3);
    let attempts = Arc::new(AtomicU32::new(0));
    let base = server.url();
    let body = {
        let attempts = Arc::clone(&attempts);
        executor
            .execute(&OpClass::tts(), move || {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let path = if n < 3 { "fail" } else { "ok" };
                call(format!("{base}/flaky/{path}"))
            })
            .await
            .unwrap()
    };

    assert_eq!(body, "audio-bytes");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    fail.assert_async().await;
    ok.assert_async().await;

    let summary = executor.metrics().op_class_summary(&OpClass::tts());
    assert_eq!(summary.count, 3);
    assert_eq!(summary.failure_count, 2);
    assert_eq!(summary.error_counts.get("overloaded"), Some(&2));
}

#[tokio::test]
async fn test_executor_does_not_retry_client_errors() {
    let mut server = mockito::Server::new_async().await;
    let m = server
        .mock("POST", "/v1/text-to-speech")
        .with_status(404)
        .with_body(r#"{"detail":{"status":"voice_not_found"}}"#)
        .expect(1)
        .create_async()
        .await;

    let executor = fast_executor(3);
    let url = format!("{}/v1/text-to-speech", server.url());
    let err = executor
        .execute(&OpClass::tts(), move || call(url.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamPermanent);
    assert_eq!(err.http_status(), 404);
    assert_eq!(err.upstream().map(|u| u.code), Some(StandardErrorCode::NotFound));
    m.assert_async().await;
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // Bind then drop to get a port with nothing listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let executor = fast_executor(2);
    let url = format!("http://127.0.0.1:{port}/v1/speech-to-text");
    let err = executor
        .execute(&OpClass::stt(), move || call(url.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamTransient);
    assert_eq!(err.upstream().map(|u| u.code), Some(StandardErrorCode::Network));
    assert_eq!(executor.metrics().op_class_summary(&OpClass::stt()).count, 2);
}
