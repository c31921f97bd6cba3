//! Integration tests for GET /csrattrs operation

use crate::integration::{
    MockEstServer, TestPki, CONTENT_TYPE_CSRATTRS, PATH_CSRATTRS, RFC_CSRATTRS_BASE64,
};
use est_enroll_core::csr::Identity;
use est_enroll_core::tls::ServerTrust;
use est_enroll_core::transport::{EstTransport, HttpTransport};
use est_enroll_core::types::csr_attrs::oids;
use est_enroll_core::{EnrollmentSession, EstError, SessionState};

#[tokio::test]
async fn test_csrattrs_not_supported() {
    let mock = MockEstServer::start().await;
    mock.mock_csrattrs_not_supported().await;

    let config = mock.config_builder().build().expect("Valid config");
    let attrs = HttpTransport::from_config(&config)
        .get_csr_attrs(ServerTrust::Unverified)
        .await
        .expect("404 should yield an empty set");

    assert!(attrs.is_empty());
}

#[tokio::test]
async fn test_rfc_example_attributes() {
    let mock = MockEstServer::start().await;
    mock.mock_csrattrs(RFC_CSRATTRS_BASE64).await;

    let config = mock.config_builder().build().expect("Valid config");
    let attrs = HttpTransport::from_config(&config)
        .get_csr_attrs(ServerTrust::Unverified)
        .await
        .expect("get_csr_attrs failed");

    assert_eq!(attrs.len(), 4);
    assert!(attrs.contains_oid(&oids::CHALLENGE_PASSWORD));
    assert!(attrs.contains_oid(&oids::EC_PUBLIC_KEY));
    assert!(attrs.contains_oid(&oids::EXTENSION_REQUEST));
    assert!(attrs.contains_oid(&oids::ECDSA_WITH_SHA384));
}

#[tokio::test]
async fn test_malformed_csrattrs() {
    let mock = MockEstServer::start().await;
    mock.mock_malformed_body(PATH_CSRATTRS, CONTENT_TYPE_CSRATTRS)
        .await;

    let config = mock.config_builder().build().expect("Valid config");
    let result = HttpTransport::from_config(&config)
        .get_csr_attrs(ServerTrust::Unverified)
        .await;

    assert!(matches!(result, Err(EstError::CsrAttrsDecode(_))));
}

#[tokio::test]
async fn test_session_csrattrs_then_enroll() {
    let mock = MockEstServer::start().await;
    let pki = std::sync::Arc::new(TestPki::new());
    mock.mock_csrattrs(RFC_CSRATTRS_BASE64).await;
    mock.mock_enroll_signing(&pki).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .build()
        .expect("Valid config");
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();

    let attrs = session.request_csr_attrs().await.unwrap();
    assert_eq!(attrs.len(), 4);
    assert_eq!(session.state(), &SessionState::TrustResolved);
    assert_eq!(session.csr_attributes().map(|a| a.len()), Some(4));

    session
        .build_csr(Identity::new("attrs.example.com"))
        .unwrap();
    session.simple_enroll().await.unwrap();
    assert_eq!(session.state(), &SessionState::Enrolled);
}
