//! Retry termination and backoff timing through the public transport API.

use std::time::Duration;

use regsync_http::fakes::ScriptedBackend;
use regsync_http::{
    ApiRequest, LastFailure, NetworkError, RawResponse, RetryPolicy, RetryingTransport, Transport,
    TransportError,
};

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_secs(1), Duration::from_secs(20))
}

#[tokio::test(start_paused = true)]
async fn always_503_makes_exactly_max_attempts() {
    for max_attempts in [1u32, 3, 5] {
        let backend = ScriptedBackend::always(Ok(RawResponse::new(503, "upstream busy")));
        let transport = RetryingTransport::new(backend, policy(max_attempts));

        let err = transport
            .send(ApiRequest::get("/api/patient-registry/user"))
            .await
            .unwrap_err();

        assert_eq!(transport.backend().calls(), max_attempts as usize);
        match err {
            TransportError::Exhausted { attempts, last, .. } => {
                assert_eq!(attempts, max_attempts);
                assert_eq!(
                    last,
                    LastFailure::Status {
                        status: 503,
                        body_preview: "upstream busy".to_string()
                    }
                );
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn success_on_the_last_allowed_attempt() {
    for max_attempts in [1u32, 3, 5] {
        let mut script: Vec<Result<RawResponse, NetworkError>> = (1..max_attempts)
            .map(|_| Ok(RawResponse::new(503, "upstream busy")))
            .collect();
        script.push(Ok(RawResponse::new(200, "{\"ok\":true}")));
        let transport = RetryingTransport::new(ScriptedBackend::new(script), policy(max_attempts));

        let resp = transport.send(ApiRequest::get("/x")).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(transport.backend().calls(), max_attempts as usize);
        assert_eq!(transport.stats().snapshot().gave_up, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn no_sleep_after_final_attempt() {
    let backend = ScriptedBackend::always(Ok(RawResponse::new(502, "")));
    let transport = RetryingTransport::new(backend, policy(4));

    let started = tokio::time::Instant::now();
    let _ = transport.send(ApiRequest::get("/x")).await;
    // 1s + 2s + 4s between four attempts, nothing after the last one.
    assert_eq!(started.elapsed(), Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn backoff_is_capped() {
    let backend = ScriptedBackend::always(Err(NetworkError::timeout("deadline elapsed")));
    let transport = RetryingTransport::new(
        backend,
        RetryPolicy::new(4, Duration::from_secs(5), Duration::from_secs(8)),
    );

    let started = tokio::time::Instant::now();
    let err = transport.send(ApiRequest::get("/x")).await.unwrap_err();
    // 5s, then 8s twice (10s and 20s capped).
    assert_eq!(started.elapsed(), Duration::from_secs(21));
    assert_eq!(err.status(), None);
    assert!(err.to_string().contains("deadline elapsed"));
}

#[tokio::test(start_paused = true)]
async fn stats_count_every_attempt() {
    let backend = ScriptedBackend::new([
        Ok(RawResponse::new(500, "")),
        Ok(RawResponse::new(200, "[]")),
        Ok(RawResponse::new(400, "bad")),
    ]);
    let transport = RetryingTransport::new(backend, policy(3));

    transport.send(ApiRequest::get("/a")).await.unwrap();
    let err = transport.send(ApiRequest::get("/b")).await.unwrap_err();
    assert_eq!(err.status(), Some(400));

    let stats = transport.stats().snapshot();
    assert_eq!(stats.requests_sent, 3);
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.gave_up, 0);
}
