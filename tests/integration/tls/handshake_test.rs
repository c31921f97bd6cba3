//! Integration tests against a real TLS endpoint

use std::sync::Arc;

use der::Encode;

use super::server::TlsEstServer;
use crate::integration::{TestPki, PATH_CACERTS, PATH_SIMPLEENROLL, PATH_SIMPLEREENROLL};
use est_enroll_core::csr::Identity;
use est_enroll_core::trust::compute_fingerprint;
use est_enroll_core::{
    EnrollmentSession, ErrorKind, EstClientConfig, EstClientConfigBuilder, EstError,
    SessionState,
};

fn https_config(server: &TlsEstServer) -> EstClientConfigBuilder {
    EstClientConfig::builder()
        .server_url(server.url())
        .expect("Valid URL")
}

#[tokio::test]
async fn test_anchor_mismatch_is_tls_trust_error() {
    let pki = Arc::new(TestPki::new());
    let server = TlsEstServer::start(pki);
    let unrelated = TestPki::new();

    let config = https_config(&server)
        .trust_explicit(unrelated.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("mismatch.example.com")).unwrap();

    let err = session.simple_enroll().await.unwrap_err();
    assert!(matches!(err, EstError::TlsTrust(_)), "got {:?}", err);
    assert!(!err.is_retryable());
    assert_eq!(session.failure().unwrap().kind, ErrorKind::TlsTrust);

    // The handshake never completed, so no request reached the server.
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn test_enroll_over_tls_with_explicit_anchor() {
    let pki = Arc::new(TestPki::new());
    let server = TlsEstServer::start(pki.clone());

    let config = https_config(&server)
        .trust_explicit(pki.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("tls.example.com")).unwrap();

    let chain = session.simple_enroll().await.expect("enrollment over TLS");
    assert_eq!(chain.len(), 3);
    assert_eq!(session.state(), &SessionState::Enrolled);

    let requests = server.requests_to(PATH_SIMPLEENROLL);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert!(requests[0].client_certificate.is_none());
}

#[tokio::test]
async fn test_reenroll_presents_issued_certificate() {
    let pki = Arc::new(TestPki::new());
    let server = TlsEstServer::start(pki.clone());

    let config = https_config(&server)
        .trust_explicit(pki.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("renew-tls.example.com")).unwrap();

    let issued = session.simple_enroll().await.unwrap().leaf().unwrap().clone();
    session.prepare_reenroll().unwrap();
    session.simple_reenroll().await.expect("re-enrollment over mutual TLS");

    let requests = server.requests_to(PATH_SIMPLEREENROLL);
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].client_certificate.as_deref(),
        Some(issued.to_der().unwrap().as_slice())
    );
}

#[tokio::test]
async fn test_implicit_bootstrap_over_tls() {
    let pki = Arc::new(TestPki::new());
    let server = TlsEstServer::start(pki.clone());

    let config = https_config(&server).trust_implicit().build().unwrap();
    let mut session = EnrollmentSession::new(config);

    let anchor = session.resolve_trust().await.expect("bootstrap over TLS");
    assert!(!anchor.is_trusted());
    assert_eq!(server.requests_to(PATH_CACERTS).len(), 1);

    let expected = [
        compute_fingerprint(&pki.root()).unwrap(),
        compute_fingerprint(&pki.issuing()).unwrap(),
    ];
    session.confirm_fingerprints(&expected).unwrap();
    session.build_csr(Identity::new("tofu-tls.example.com")).unwrap();
    session.simple_enroll().await.expect("enrollment after confirmation");

    let outcome = session.finish().unwrap();
    assert_eq!(outcome.chain.len(), 3);
}
