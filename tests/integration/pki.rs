//! Test PKI generated at runtime.
//!
//! A root CA and an issuing CA, able to sign the CSRs the client submits.

use std::net::{IpAddr, Ipv4Addr};

use der::Decode;
use est_enroll_core::types::encode_certs_only_base64;
use est_enroll_core::Certificate;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, IsCa, KeyPair, SanType,
};
use rustls::pki_types::{
    CertificateDer, CertificateSigningRequestDer, PrivateKeyDer, PrivatePkcs8KeyDer,
};

/// Root plus issuing CA.
pub struct TestPki {
    root_cert: rcgen::Certificate,
    issuing_cert: rcgen::Certificate,
    issuing_key: KeyPair,
}

fn ca_params(cn: &str) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn.push(DnType::OrganizationName, "EST Test PKI");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
}

impl TestPki {
    /// Generate a fresh two-level PKI.
    pub fn new() -> Self {
        let root_key = KeyPair::generate().expect("root key");
        let root_cert = ca_params("EST Test Root CA")
            .self_signed(&root_key)
            .expect("root cert");

        let issuing_key = KeyPair::generate().expect("issuing key");
        let issuing_cert = ca_params("EST Test Issuing CA")
            .signed_by(&issuing_key, &root_cert, &root_key)
            .expect("issuing cert");

        Self {
            root_cert,
            issuing_cert,
            issuing_key,
        }
    }

    /// Root CA certificate as PEM.
    pub fn root_pem(&self) -> String {
        self.root_cert.pem()
    }

    /// Root CA certificate as DER.
    pub fn root_der(&self) -> CertificateDer<'static> {
        self.root_cert.der().clone()
    }

    /// Root CA certificate.
    pub fn root(&self) -> Certificate {
        Certificate::from_der(self.root_cert.der()).expect("root DER")
    }

    /// Issuing CA certificate.
    pub fn issuing(&self) -> Certificate {
        Certificate::from_der(self.issuing_cert.der()).expect("issuing DER")
    }

    /// `/cacerts` body: both CA certificates, base64 certs-only.
    pub fn cacerts_base64(&self) -> String {
        encode_certs_only_base64(&[self.root(), self.issuing()]).expect("certs-only")
    }

    /// Sign a PKCS#10 request with the issuing CA.
    pub fn sign_csr(&self, csr_der: &[u8]) -> Certificate {
        let der = CertificateSigningRequestDer::from(csr_der.to_vec());
        let csr = CertificateSigningRequestParams::from_der(&der).expect("CSR");
        let cert = csr
            .signed_by(&self.issuing_cert, &self.issuing_key)
            .expect("sign CSR");
        Certificate::from_der(cert.der()).expect("leaf DER")
    }

    /// TLS server certificate for `localhost` and `127.0.0.1`, issued by the
    /// issuing CA, with the chain to present and its private key.
    pub fn server_identity(&self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().expect("server key");
        let mut params =
            CertificateParams::new(vec!["localhost".to_string()]).expect("server params");
        params
            .subject_alt_names
            .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "localhost");
        params.distinguished_name = dn;

        let cert = params
            .signed_by(&key, &self.issuing_cert, &self.issuing_key)
            .expect("server cert");
        let chain = vec![cert.der().clone(), self.issuing_cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        (chain, key)
    }

    /// Enrollment body: the signed leaf plus both CAs, base64 certs-only.
    pub fn enroll_response(&self, csr_der: &[u8]) -> String {
        let leaf = self.sign_csr(csr_der);
        encode_certs_only_base64(&[self.root(), leaf, self.issuing()]).expect("certs-only")
    }
}
