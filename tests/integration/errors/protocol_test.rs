//! Integration tests for malformed server responses

use crate::integration::{MockEstServer, TestPki, CONTENT_TYPE_PKCS7, PATH_CACERTS, PATH_SIMPLEENROLL};
use est_enroll_core::csr::Identity;
use est_enroll_core::types::encode_certs_only_base64;
use est_enroll_core::{EnrollmentSession, ErrorKind, EstError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

async fn enroll_against(mock: &MockEstServer, pki: &TestPki) -> (EnrollmentSession, EstError) {
    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("broken.example.com")).unwrap();
    let err = session.simple_enroll().await.unwrap_err();
    (session, err)
}

#[tokio::test]
async fn test_garbage_enrollment_response_not_retried() {
    let mock = MockEstServer::start().await;
    let pki = TestPki::new();

    Mock::given(method("POST"))
        .and(path(PATH_SIMPLEENROLL))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("bm90IGEgUEtDUyM3IG1lc3NhZ2U=")
                .insert_header("Content-Type", CONTENT_TYPE_PKCS7),
        )
        .mount(mock.inner())
        .await;

    let (session, err) = enroll_against(&mock, &pki).await;
    assert!(matches!(err, EstError::Pkcs7Decode(_)));
    assert_eq!(session.failure().unwrap().kind, ErrorKind::Pkcs7Decode);
    assert_eq!(mock.requests_to(PATH_SIMPLEENROLL).await.len(), 1);
}

#[tokio::test]
async fn test_empty_certificate_set() {
    let mock = MockEstServer::start().await;
    let pki = TestPki::new();

    Mock::given(method("POST"))
        .and(path(PATH_SIMPLEENROLL))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(encode_certs_only_base64(&[]).unwrap())
                .insert_header("Content-Type", CONTENT_TYPE_PKCS7),
        )
        .mount(mock.inner())
        .await;

    let (_session, err) = enroll_against(&mock, &pki).await;
    assert!(matches!(err, EstError::Pkcs7Decode(_)));
}

#[tokio::test]
async fn test_bootstrap_server_error() {
    let mock = MockEstServer::start().await;

    Mock::given(method("GET"))
        .and(path(PATH_CACERTS))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(mock.inner())
        .await;

    let config = mock.config_builder().trust_implicit().build().unwrap();
    let mut session = EnrollmentSession::new(config);

    let err = session.resolve_trust().await.unwrap_err();
    assert!(matches!(err, EstError::TrustBootstrap(_)));
    assert!(err.to_string().contains("internal error"));
    assert_eq!(session.failure().unwrap().kind, ErrorKind::TrustBootstrap);
}
