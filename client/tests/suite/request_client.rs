use std::sync::Arc;
use std::time::Duration;

use brand_audit_client::AnalysisApi;
use brand_audit_client::CircuitBreakerRegistry;
use brand_audit_client::CircuitState;
use brand_audit_client::ClientConfig;
use brand_audit_client::ErrorKind;
use brand_audit_client::NoticeLevel;
use brand_audit_client::Presentation;
use brand_audit_client::RequestClient;
use brand_audit_client::api::STATUS_ROUTE;
use brand_audit_client::client::CORRELATION_ID_HEADER;
use brand_audit_client::retry;
use client_test_support::RecordingNotifier;
use client_test_support::fast_config;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::body_json;
use wiremock::matchers::header;
use wiremock::matchers::header_exists;
use wiremock::matchers::method;
use wiremock::matchers::path;

fn api_with(config: &ClientConfig) -> (AnalysisApi, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit_config()));
    let client = RequestClient::new(config, circuits, notifier.clone()).expect("client");
    (AnalysisApi::new(Arc::new(client)), notifier)
}

fn api_for(server: &MockServer) -> (AnalysisApi, Arc<RecordingNotifier>) {
    api_with(&fast_config(&server.uri()))
}

const STATUS_KEY: &str = "GET /analyze/{id}/status";

#[tokio::test]
async fn unauthorized_is_not_retried_and_leaves_circuit_alone() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "token expired"})))
        .expect(1)
        .mount(&server)
        .await;

    let (api, notifier) = api_for(&server);
    let err = api.start_analysis("Acme").await.expect_err("401");

    assert_eq!(err.kind, ErrorKind::Unauthorized);
    assert_eq!(err.status, Some(401));
    assert_eq!(err.endpoint, "POST /analyze");
    assert!(err.message.contains("token expired"));
    assert_eq!(err.presentation(), Presentation::ActionRequired);

    let circuit = api.client().circuits().circuit("POST /analyze").expect("circuit");
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.failure_count, 0);

    let notices = notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
}

#[tokio::test]
async fn invalid_request_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/analyze/missing/results"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (api, _) = api_for(&server);
    let err = api.results("missing").await.expect_err("404");
    assert_eq!(err.kind, ErrorKind::InvalidRequest);
    assert!(!err.retryable);
}

#[tokio::test]
async fn empty_company_name_never_reaches_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (api, _) = api_for(&server);
    let err = api.start_analysis("   ").await.expect_err("empty name");
    assert_eq!(err.kind, ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn rate_limit_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .and(body_json(json!({"company_name": "Acme"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "analysis_id": "job-7",
            "status": "started"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (api, notifier) = api_for(&server);
    let response = api.start_analysis("  Acme ").await.expect("second attempt succeeds");

    assert_eq!(response.analysis_id, "job-7");
    assert!(notifier.notices().is_empty());
    assert_eq!(
        api.client().circuits().state("POST /analyze"),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn retries_share_one_correlation_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-1/results"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-1/results"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 82})))
        .mount(&server)
        .await;

    let (api, _) = api_for(&server);
    let results = api.results("job-1").await.expect("third attempt succeeds");
    assert_eq!(results, json!({"score": 82}));

    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 3);
    let ids: Vec<String> = requests
        .iter()
        .map(|r| {
            r.headers
                .get(CORRELATION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .expect("correlation id")
                .to_string()
        })
        .collect();
    assert!(ids.iter().all(|id| id == &ids[0]));

    let signature = retry::signature("GET /analyze/{id}/results", None);
    assert_eq!(api.client().retry_executor().attempts_for(&signature), 3);
}

#[tokio::test]
async fn requests_carry_auth_and_json_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .and(header("authorization", "Bearer secret-token"))
        .and(header("content-type", "application/json"))
        .and(header_exists(CORRELATION_ID_HEADER))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "ok",
            "version": "2.1.0",
            "uptime": 1234
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = fast_config(&server.uri());
    config.api.auth_token = Some("secret-token".to_string());
    let (api, _) = api_with(&config);

    let health = api.health().await.expect("healthy");
    assert!(health.is_healthy());
    assert_eq!(health.version.as_deref(), Some("2.1.0"));
}

#[tokio::test]
async fn auth_token_can_be_replaced_at_runtime() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .and(header("authorization", "Bearer rotated"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = fast_config(&server.uri());
    config.api.auth_token = Some("stale".to_string());
    let (api, _) = api_with(&config);
    api.client().set_auth_token(Some("rotated".to_string()));

    api.health().await.expect("rotated token accepted");
}

#[tokio::test]
async fn malformed_success_body_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-1/results"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{oops"))
        .expect(3)
        .mount(&server)
        .await;

    let (api, notifier) = api_for(&server);
    let err = api.results("job-1").await.expect_err("never valid json");

    assert_eq!(err.kind, ErrorKind::Unknown);
    assert!(err.retryable);
    let signature = retry::signature("GET /analyze/{id}/results", None);
    assert_eq!(api.client().retry_executor().attempts_for(&signature), 3);
    assert_eq!(notifier.notices().len(), 1);
}

#[tokio::test]
async fn malformed_body_then_valid_body_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-1/results"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{oops"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-1/results"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"score": 61})))
        .mount(&server)
        .await;

    let (api, _) = api_for(&server);
    let results = api.results("job-1").await.expect("second attempt parses");
    assert_eq!(results, json!({"score": 61}));
}

#[tokio::test]
async fn unexpected_response_shape_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/analyze"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "job-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let (api, _) = api_for(&server);
    let err = api.start_analysis("Acme").await.expect_err("no analysis_id");

    assert_eq!(err.kind, ErrorKind::InvalidRequest);
    assert!(!err.retryable);
    let circuit = api.client().circuits().circuit("POST /analyze").expect("circuit");
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.failure_count, 0);
}

#[tokio::test]
async fn health_is_attempted_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let (api, _) = api_for(&server);
    let err = api.health().await.expect_err("500");
    assert_eq!(err.kind, ErrorKind::ServerFault);
    assert_eq!(err.presentation(), Presentation::Transient);
}

#[tokio::test]
async fn unreachable_service_is_network_unavailable() {
    let uri = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        format!("http://{}", listener.local_addr().expect("addr"))
    };

    let (api, _) = api_with(&fast_config(&uri));
    let err = api.status("job-1").await.expect_err("nothing listening");

    assert_eq!(err.kind, ErrorKind::NetworkUnavailable);
    assert_eq!(err.status, None);
    let circuit = api.client().circuits().circuit(STATUS_KEY).expect("circuit");
    assert_eq!(circuit.failure_count, 1);
    assert_eq!(
        api.client()
            .retry_executor()
            .attempts_for(&retry::signature(STATUS_KEY, None)),
        3
    );
}

#[tokio::test]
async fn repeated_server_faults_open_the_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-1/status"))
        .respond_with(ResponseTemplate::new(503))
        .expect(9)
        .mount(&server)
        .await;

    let (api, notifier) = api_for(&server);
    for _ in 0..3 {
        let err = api.status("job-1").await.expect_err("503");
        assert_eq!(err.kind, ErrorKind::ServerFault);
    }
    assert_eq!(api.client().circuits().state(STATUS_KEY), CircuitState::Open);

    let err = api.status("job-1").await.expect_err("circuit open");
    let ErrorKind::CircuitOpen { retry_after } = err.kind else {
        panic!("expected circuit open, got {:?}", err.kind);
    };
    assert!(retry_after > Duration::from_secs(59), "{retry_after:?}");
    assert!(retry_after <= Duration::from_secs(60), "{retry_after:?}");
    assert_eq!(err.presentation(), Presentation::TemporarilyUnavailable);

    // The circuit is per route, so another job's status is rejected too.
    let err = api.status("job-2").await.expect_err("circuit open");
    assert!(matches!(err.kind, ErrorKind::CircuitOpen { .. }));

    assert_eq!(notifier.notices().len(), 5);
    assert_eq!(STATUS_KEY, format!("GET {STATUS_ROUTE}"));
}

#[tokio::test]
async fn half_open_probe_closes_circuit_on_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-1/status"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-1/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "processing",
            "progress": 40
        })))
        .mount(&server)
        .await;

    let mut config = fast_config(&server.uri());
    config.retry.max_attempts = 1;
    config.circuit.open_secs = 1;
    let (api, _) = api_with(&config);

    for _ in 0..3 {
        api.status("job-1").await.expect_err("500");
    }
    assert_eq!(api.client().circuits().state(STATUS_KEY), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let status = api.status("job-1").await.expect("probe succeeds");
    assert_eq!(status.progress, 40.0);

    let circuit = api.client().circuits().circuit(STATUS_KEY).expect("circuit");
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.failure_count, 0);
}

#[tokio::test]
async fn polling_waits_for_terminal_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-9/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "processing",
            "progress": 50
        })))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/analyze/job-9/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "completed",
            "progress": 100
        })))
        .mount(&server)
        .await;

    let (api, _) = api_for(&server);
    let mut seen = Vec::new();
    let done = api
        .wait_for_completion_with("job-9", Duration::from_millis(5), |s| seen.push(s.status))
        .await
        .expect("completes");

    assert_eq!(done.progress, 100.0);
    assert_eq!(seen.len(), 3);
}
