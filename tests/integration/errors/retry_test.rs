//! Integration tests for session retry behaviour

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::integration::{MockEstServer, TestPki, PATH_SIMPLEENROLL};
use est_enroll_core::csr::Identity;
use est_enroll_core::{
    EnrollmentSession, ErrorKind, EstClientConfig, EstError, RetryPolicy, SessionState,
};

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..RetryPolicy::default()
    }
}

#[tokio::test]
async fn test_pending_then_issued() {
    let mock = MockEstServer::start().await;
    let pki = Arc::new(TestPki::new());
    mock.mock_enroll_pending(Some(1), 1).await;
    mock.mock_enroll_signing(&pki).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("pending.example.com")).unwrap();
    let csr_der = session.csr().unwrap().der().to_vec();

    let started = Instant::now();
    session.simple_enroll().await.expect("enrollment after 202");
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(session.state(), &SessionState::Enrolled);

    // The same CSR is resubmitted.
    let requests = mock.requests_to(PATH_SIMPLEENROLL).await;
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(
            base64::Engine::decode(&base64::prelude::BASE64_STANDARD, &request.body).unwrap(),
            csr_der
        );
    }
}

#[tokio::test]
async fn test_pending_retries_exhausted() {
    let mock = MockEstServer::start().await;
    let pki = TestPki::new();
    mock.mock_enroll_pending(Some(0), 10).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .retry_policy(RetryPolicy {
            max_pending_retries: 2,
            ..RetryPolicy::default()
        })
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("stuck.example.com")).unwrap();

    let err = session.simple_enroll().await.unwrap_err();
    assert!(matches!(err, EstError::EnrollmentRejected { status: 202, .. }));
    assert_eq!(mock.requests_to(PATH_SIMPLEENROLL).await.len(), 3);
    assert_eq!(
        session.failure().unwrap().kind,
        ErrorKind::EnrollmentRejected
    );
}

#[tokio::test]
async fn test_service_unavailable_with_retry_after() {
    let mock = MockEstServer::start().await;
    let pki = Arc::new(TestPki::new());

    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .and(wiremock::matchers::path(PATH_SIMPLEENROLL))
        .respond_with(
            wiremock::ResponseTemplate::new(503)
                .insert_header("Retry-After", "0")
                .set_body_string("busy"),
        )
        .up_to_n_times(1)
        .mount(mock.inner())
        .await;
    mock.mock_enroll_signing(&pki).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("busy.example.com")).unwrap();

    session.simple_enroll().await.expect("retry after 503");
    assert_eq!(mock.requests_to(PATH_SIMPLEENROLL).await.len(), 2);
}

#[tokio::test]
async fn test_connection_refused_retries_then_fails() {
    let pki = TestPki::new();

    // Nothing listens on the discard port.
    let config = EstClientConfig::builder()
        .server_url("http://127.0.0.1:9")
        .unwrap()
        .allow_insecure_http()
        .trust_explicit(pki.root_pem())
        .retry_policy(fast_retries())
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("offline.example.com")).unwrap();

    let err = session.simple_enroll().await.unwrap_err();
    assert!(matches!(err, EstError::Transport(_)), "got {:?}", err);
    assert_eq!(session.failure().unwrap().kind, ErrorKind::Transport);
}

#[tokio::test]
async fn test_cancelled_while_pending() {
    let mock = MockEstServer::start().await;
    let pki = TestPki::new();
    mock.mock_enroll_pending(Some(600), 1).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("cancel.example.com")).unwrap();

    let token = session.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = session.simple_enroll().await.unwrap_err();
    assert!(matches!(err, EstError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(session.failure().unwrap().kind, ErrorKind::Cancelled);
}
