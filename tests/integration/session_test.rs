//! End-to-end enrollment sessions against a mock EST server

use std::sync::Arc;

use crate::integration::{MockEstServer, TestPki, PATH_SIMPLEENROLL};
use est_enroll_core::csr::{Identity, KeySpec};
use est_enroll_core::{
    CertificateChain, EnrollmentSession, ErrorKind, EstError, EstSettings, SessionState,
};
use x509_cert::der::Encode;

#[tokio::test]
async fn test_explicit_trust_enrollment() {
    let mock = MockEstServer::start().await;
    let pki = Arc::new(TestPki::new());
    mock.mock_enroll_signing(&pki).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .http_auth("device001", "secret")
        .key_spec(KeySpec::EcdsaP384)
        .build()
        .unwrap();

    let mut session = EnrollmentSession::new(config);
    let anchor = session.resolve_trust().await.unwrap();
    assert!(anchor.is_trusted());
    assert_eq!(anchor.certificates(), &[pki.root()]);

    session
        .build_csr(
            Identity::new("device001.example.com")
                .organization("Example Corp")
                .organizational_unit("Devices")
                .country("US"),
        )
        .unwrap();
    let chain = session.simple_enroll().await.unwrap();
    assert_eq!(chain.len(), 3);

    let outcome = session.finish().unwrap();
    let reparsed = CertificateChain::from_pem(outcome.pem.as_bytes()).unwrap();
    assert_eq!(reparsed, outcome.chain);
    assert_eq!(
        reparsed.leaf().unwrap().to_der().unwrap(),
        outcome.chain.leaf().unwrap().to_der().unwrap()
    );
    assert_eq!(outcome.key.spec(), KeySpec::EcdsaP384);
    assert_eq!(outcome.trust_anchor.certificates(), &[pki.root()]);
}

#[tokio::test]
async fn test_enroll_before_trust_makes_no_request() {
    let mock = MockEstServer::start().await;
    let pki = Arc::new(TestPki::new());
    mock.mock_enroll_signing(&pki).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);

    let err = session.simple_enroll().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(session.state(), &SessionState::Init);
    assert!(mock.requests_to(PATH_SIMPLEENROLL).await.is_empty());
}

#[tokio::test]
async fn test_rejection_fails_session() {
    let mock = MockEstServer::start().await;
    let pki = TestPki::new();
    mock.mock_enroll_auth_required().await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("denied.example.com")).unwrap();

    let err = session.simple_enroll().await.unwrap_err();
    assert!(matches!(err, EstError::EnrollmentRejected { status: 401, .. }));

    let failure = session.failure().expect("session should be failed");
    assert_eq!(failure.kind, ErrorKind::EnrollmentRejected);
    assert!(matches!(
        session.simple_enroll().await,
        Err(EstError::InvalidState { .. })
    ));
    assert_eq!(mock.requests_to(PATH_SIMPLEENROLL).await.len(), 1);
}

#[tokio::test]
async fn test_session_from_settings_file() {
    let mock = MockEstServer::start().await;
    let pki = Arc::new(TestPki::new());
    mock.mock_enroll_signing(&pki).await;

    let dir = tempfile::tempdir().unwrap();
    let bundle = dir.path().join("ca.pem");
    std::fs::write(&bundle, pki.root_pem()).unwrap();
    let settings_path = dir.path().join("est.toml");
    std::fs::write(
        &settings_path,
        format!(
            r#"
            [server]
            url = "{url}"
            allow_insecure_http = true

            [trust]
            mode = "explicit"
            ca_bundle_path = {bundle:?}

            [identity]
            common_name = "settings.example.com"
            country = "DE"

            [enrollment]
            key = "ed25519"
            "#,
            url = mock.url(),
        ),
    )
    .unwrap();

    let settings = EstSettings::from_file(&settings_path).unwrap();
    let identity = settings.identity().cloned().unwrap();
    let mut session = EnrollmentSession::new(settings.into_config().unwrap());

    session.resolve_trust().await.unwrap();
    session.build_csr(identity).unwrap();
    session.simple_enroll().await.unwrap();
    let outcome = session.finish().unwrap();
    assert_eq!(outcome.key.spec(), KeySpec::Ed25519);
}
