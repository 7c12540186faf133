//! Generator client contract tests against a mock HTTP service.

use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use bandconf::GeneratorSettings;
use bandproto::generator::SubmitRequest;
use bandstand::generator::{GeneratorClient, CIRCUIT_OPEN_ERROR};

fn settings_for(server: &MockServer) -> GeneratorSettings {
    GeneratorSettings {
        base_url: server.uri(),
        timeout_secs: 5,
        max_concurrent: 2,
        cb_threshold: 3,
        cb_cooldown_secs: 60,
        poll_timeout_secs: 1,
        poll_max_attempts: 5,
        submit_retry_delays_secs: vec![0, 0, 0, 0],
    }
}

fn request() -> SubmitRequest {
    SubmitRequest {
        genre: "house".into(),
        tempo: 124,
        instruments: vec!["drums".into()],
        bars: 4,
        key: Some("Am".into()),
        quality_preset: "quality".into(),
        ..Default::default()
    }
}

fn notes_payload(count: usize) -> serde_json::Value {
    let notes: Vec<_> = (0..count)
        .map(|i| json!({"pitch": 36, "startBeat": i as f64, "durationBeats": 0.5, "velocity": 110}))
        .collect();
    json!(notes)
}

#[tokio::test]
async fn cache_hit_returns_without_polling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobId": "j-1",
            "status": "complete",
            "result": {"success": true, "notes": notes_payload(8)}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = GeneratorClient::new(settings_for(&server));
    let result = client.generate(request()).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.notes.len(), 8);

    // The fast path never touches the poll endpoint.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn submit_then_poll_until_complete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobId": "job-7",
            "status": "queued",
            "position": 1
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/job-7/wait"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "complete",
            "result": {"success": true, "notes": notes_payload(12)}
        })))
        .mount(&server)
        .await;

    let client = GeneratorClient::new(settings_for(&server));
    let result = client.generate(request()).await;
    assert!(result.success);
    assert_eq!(result.notes.len(), 12);
}

#[tokio::test]
async fn queued_then_running_then_complete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobId": "job-9",
            "status": "queued"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/job-9/wait"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "running"
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/job-9/wait"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "complete",
            "result": {"success": true, "notes": notes_payload(4)}
        })))
        .mount(&server)
        .await;

    let client = GeneratorClient::new(settings_for(&server));
    let result = client.generate(request()).await;
    assert!(result.success);
}

#[tokio::test]
async fn submit_retries_on_503_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobId": "j-2",
            "status": "complete",
            "result": {"success": true, "notes": notes_payload(6)}
        })))
        .mount(&server)
        .await;

    let client = GeneratorClient::new(settings_for(&server));
    let result = client.generate(request()).await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.retry_count() >= 2);
}

#[tokio::test]
async fn failed_job_reports_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobId": "job-3",
            "status": "queued"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/job-3/wait"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "failed",
            "error": "model exploded"
        })))
        .mount(&server)
        .await;

    let client = GeneratorClient::new(settings_for(&server));
    let result = client.generate(request()).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("model exploded"));
}

#[tokio::test]
async fn circuit_opens_after_three_failures_and_fails_fast() {
    // Point at a closed port so every submit is a connection error.
    let mut settings = GeneratorSettings {
        base_url: "http://127.0.0.1:9".to_string(),
        submit_retry_delays_secs: vec![0],
        cb_threshold: 3,
        cb_cooldown_secs: 60,
        ..Default::default()
    };
    settings.timeout_secs = 2;
    let client = GeneratorClient::new(settings);

    for _ in 0..3 {
        let result = client.generate(request()).await;
        assert!(!result.success);
    }
    assert!(client.circuit_open());

    // Fourth call: fail-fast, no I/O.
    let start = Instant::now();
    let result = client.generate(request()).await;
    assert_eq!(result.error.as_deref(), Some(CIRCUIT_OPEN_ERROR));
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn half_open_probe_success_closes_circuit() {
    let server = MockServer::start().await;
    // First three submits fail hard (500 is non-transient).
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobId": "j-4",
            "status": "complete",
            "result": {"success": true, "notes": notes_payload(5)}
        })))
        .mount(&server)
        .await;

    let mut settings = settings_for(&server);
    // Zero cooldown: the window elapses immediately, so the next call
    // is the half-open probe.
    settings.cb_cooldown_secs = 0;
    let client = GeneratorClient::new(settings);

    for _ in 0..3 {
        assert!(!client.generate(request()).await.success);
    }
    assert!(!client.circuit_open(), "cooldown elapsed, probe allowed");

    let probe = client.generate(request()).await;
    assert!(probe.success);
    assert!(!client.circuit_open());
}

#[tokio::test]
async fn poll_timeout_is_not_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobId": "slow-job",
            "status": "queued"
        })))
        .mount(&server)
        .await;
    // First poll hangs past the client's per-poll timeout; second
    // completes. The job "kept running server-side".
    Mock::given(method("GET"))
        .and(path("/jobs/slow-job/wait"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(30))
                .set_body_json(json!({"status": "running"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/slow-job/wait"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "complete",
            "result": {"success": true, "notes": notes_payload(3)}
        })))
        .mount(&server)
        .await;

    let client = GeneratorClient::new(settings_for(&server));
    let result = client.generate(request()).await;
    assert!(result.success, "{:?}", result.error);
}

#[tokio::test]
async fn health_check_drives_warmup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let client = GeneratorClient::new(settings_for(&server));
    assert!(client.health_check().await);
    client.warmup().await;
}

#[tokio::test]
async fn concurrency_is_bounded_by_semaphore() {
    let server = MockServer::start().await;
    let slow_body = ResponseTemplate::new(200)
        .set_delay(Duration::from_millis(300))
        .set_body_json(json!({
            "jobId": "x",
            "status": "complete",
            "result": {"success": true, "notes": notes_payload(1)}
        }));
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(slow_body)
        .mount(&server)
        .await;

    let mut settings = settings_for(&server);
    settings.max_concurrent = 1;
    let client = std::sync::Arc::new(GeneratorClient::new(settings));

    let start = Instant::now();
    let a = {
        let client = client.clone();
        tokio::spawn(async move { client.generate(request()).await })
    };
    let b = {
        let client = client.clone();
        tokio::spawn(async move { client.generate(request()).await })
    };
    assert!(a.await.unwrap().success);
    assert!(b.await.unwrap().success);
    // With one slot the calls serialise: two 300ms responses back to back.
    assert!(start.elapsed() >= Duration::from_millis(600));
}

#[tokio::test]
async fn submit_request_body_reaches_the_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobId": "j-5",
            "status": "complete",
            "result": {"success": true, "notes": notes_payload(4)}
        })))
        .mount(&server)
        .await;

    let client = GeneratorClient::new(settings_for(&server));
    let _ = client.generate(request()).await;

    let received: Vec<Request> = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["genre"], "house");
    assert_eq!(body["tempo"], 124);
    assert_eq!(body["instruments"], json!(["drums"]));
    assert_eq!(body["quality_preset"], "quality");
}
