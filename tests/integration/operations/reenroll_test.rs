//! Integration tests for POST /simplereenroll operation

use std::sync::Arc;

use crate::integration::{MockEstServer, TestPki, PATH_SIMPLEENROLL, PATH_SIMPLEREENROLL};
use est_enroll_core::config::{AuthCredential, ClientIdentity};
use est_enroll_core::csr::{build_csr, build_csr_with_key, Identity, KeySpec};
use est_enroll_core::tls::ServerTrust;
use est_enroll_core::transport::{EstTransport, HttpTransport};
use est_enroll_core::{decode_pkcs7, EnrollmentSession, ReenrollKeyPolicy, SessionState};

#[tokio::test]
async fn test_reenroll_with_client_certificate() {
    let mock = MockEstServer::start().await;
    let pki = Arc::new(TestPki::new());
    mock.mock_enroll_signing(&pki).await;
    mock.mock_reenroll_signing(&pki).await;

    let config = mock.config_builder().build().expect("Valid config");
    let transport = HttpTransport::from_config(&config);
    let identity = Identity::new("renew.example.com");

    let (key, csr) = build_csr(&identity, KeySpec::EcdsaP256).unwrap();
    let issued = decode_pkcs7(
        &transport
            .simple_enroll(ServerTrust::Unverified, csr.der(), None)
            .await
            .unwrap(),
    )
    .unwrap();

    let client = AuthCredential::ClientCert(ClientIdentity::new(
        issued.to_pem().unwrap(),
        key.private_key_pem(),
    ));
    let renewal_csr = build_csr_with_key(&identity, &key).unwrap();
    let renewed = decode_pkcs7(
        &transport
            .simple_reenroll(ServerTrust::Unverified, renewal_csr.der(), Some(&client))
            .await
            .expect("simple_reenroll failed"),
    )
    .unwrap();

    assert_eq!(
        renewed.leaf().unwrap().tbs_certificate.subject,
        issued.leaf().unwrap().tbs_certificate.subject
    );
    assert_ne!(renewed.leaf(), issued.leaf());

    let requests = mock.requests_to(PATH_SIMPLEREENROLL).await;
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_session_reenroll_reuses_key() {
    let mock = MockEstServer::start().await;
    let pki = Arc::new(TestPki::new());
    mock.mock_enroll_signing(&pki).await;
    mock.mock_reenroll_signing(&pki).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .http_auth("device", "secret")
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session
        .build_csr(Identity::new("renew.example.com").country("US"))
        .unwrap();
    let original_key = session.csr().unwrap().public_key_der().unwrap();
    session.simple_enroll().await.unwrap();

    let csr = session.prepare_reenroll().unwrap();
    assert_eq!(csr.public_key_der().unwrap(), original_key);
    session.simple_reenroll().await.unwrap();
    assert_eq!(session.state(), &SessionState::Enrolled);

    // Basic credentials go to /simpleenroll only.
    let enroll = mock.requests_to(PATH_SIMPLEENROLL).await;
    assert!(enroll[0].headers.get("authorization").is_some());
    let reenroll = mock.requests_to(PATH_SIMPLEREENROLL).await;
    assert!(reenroll[0].headers.get("authorization").is_none());

    let outcome = session.finish().unwrap();
    assert_eq!(outcome.key.public_key_der(), original_key);
}

#[tokio::test]
async fn test_session_reenroll_regenerates_key() {
    let mock = MockEstServer::start().await;
    let pki = Arc::new(TestPki::new());
    mock.mock_enroll_signing(&pki).await;
    mock.mock_reenroll_signing(&pki).await;

    let config = mock
        .config_builder()
        .trust_explicit(pki.root_pem())
        .reenroll_key_policy(ReenrollKeyPolicy::Regenerate)
        .build()
        .unwrap();
    let mut session = EnrollmentSession::new(config);
    session.resolve_trust().await.unwrap();
    session.build_csr(Identity::new("rekey.example.com")).unwrap();
    let original_key = session.csr().unwrap().public_key_der().unwrap();
    session.simple_enroll().await.unwrap();

    let new_key = session.prepare_reenroll().unwrap().public_key_der().unwrap();
    assert_ne!(new_key, original_key);
    session.simple_reenroll().await.unwrap();

    let outcome = session.finish().unwrap();
    assert_eq!(outcome.key.public_key_der(), new_key);
}
