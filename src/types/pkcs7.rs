//! PKCS#7/CMS certs-only handling.
//!
//! EST returns issued certificates and CA bundles as a degenerate CMS
//! SignedData: no signers, no content, only the `certificates` set. This
//! module extracts those certificates without verifying any signature, and
//! can build such bundles for tests and tooling.

use base64::prelude::*;
use cms::cert::CertificateChoices;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{CertificateSet, EncapsulatedContentInfo, SignedData, SignerInfos};
use const_oid::db::rfc5911::{ID_DATA, ID_SIGNED_DATA};
use der::asn1::SetOfVec;
use der::{Any, Decode, Encode};
use x509_cert::Certificate;

use crate::chain::CertificateChain;
use crate::error::{EstError, Result};

/// Decodes a certs-only PKCS#7 structure into a certificate chain.
pub trait Pkcs7Decoder: Send + Sync {
    /// Decode DER bytes.
    fn decode(&self, der: &[u8]) -> Result<CertificateChain>;
}

/// [`Pkcs7Decoder`] backed by the RustCrypto `cms` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CmsPkcs7Decoder;

impl Pkcs7Decoder for CmsPkcs7Decoder {
    fn decode(&self, der: &[u8]) -> Result<CertificateChain> {
        decode_pkcs7(der)
    }
}

/// Parse a DER PKCS#7 certs-only structure.
///
/// The returned chain is ordered leaf first. Fails if the input is not
/// valid ASN.1, not SignedData, or carries no X.509 certificate.
pub fn decode_pkcs7(der: &[u8]) -> Result<CertificateChain> {
    let content_info = ContentInfo::from_der(der)
        .map_err(|e| EstError::pkcs7_decode(format!("Failed to parse ContentInfo: {}", e)))?;

    let signed_data = extract_signed_data(&content_info)?;
    let certificates = extract_certificates(&signed_data)?;

    if certificates.is_empty() {
        return Err(EstError::pkcs7_decode("SignedData contains no certificates"));
    }

    Ok(CertificateChain::from_unordered(certificates))
}

/// Parse a base64 body, as sent by EST servers, into a certificate chain.
pub fn decode_pkcs7_base64(body: &[u8]) -> Result<CertificateChain> {
    decode_pkcs7(&decode_base64(body)?)
}

/// Decode base64 data, ignoring any whitespace and line breaks.
pub(crate) fn decode_base64(data: &[u8]) -> Result<Vec<u8>> {
    let cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    BASE64_STANDARD
        .decode(&cleaned)
        .map_err(|e| EstError::pkcs7_decode(format!("Invalid base64 body: {}", e)))
}

fn extract_signed_data(content_info: &ContentInfo) -> Result<SignedData> {
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(EstError::pkcs7_decode(format!(
            "Expected SignedData OID, got {}",
            content_info.content_type
        )));
    }

    let content = content_info
        .content
        .to_der()
        .map_err(|e| EstError::pkcs7_decode(format!("Failed to encode content: {}", e)))?;

    SignedData::from_der(&content)
        .map_err(|e| EstError::pkcs7_decode(format!("Failed to parse SignedData: {}", e)))
}

fn extract_certificates(signed_data: &SignedData) -> Result<Vec<Certificate>> {
    let cert_set = match &signed_data.certificates {
        Some(certs) => certs,
        None => return Ok(Vec::new()),
    };

    let mut certificates = Vec::with_capacity(cert_set.0.len());
    for choice in cert_set.0.iter() {
        if let CertificateChoices::Certificate(cert) = choice {
            certificates.push(cert.clone());
        } else {
            tracing::warn!("Skipping non-X.509 certificate in SignedData");
        }
    }

    Ok(certificates)
}

/// Build a degenerate certs-only SignedData wrapping `certs`, DER encoded.
///
/// DER sorts SET OF members, so the order of `certs` is not preserved in the
/// encoding. [`decode_pkcs7`] restores leaf-first order from issuer links.
pub fn encode_certs_only(certs: &[Certificate]) -> Result<Vec<u8>> {
    let choices: Vec<CertificateChoices> = certs
        .iter()
        .cloned()
        .map(CertificateChoices::Certificate)
        .collect();

    let certificates = SetOfVec::try_from(choices)
        .map_err(|e| EstError::pkcs7_decode(format!("Failed to build certificate set: {}", e)))?;

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::new(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(certificates)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };

    let content_info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)
            .map_err(|e| EstError::pkcs7_decode(format!("Failed to encode SignedData: {}", e)))?,
    };

    content_info
        .to_der()
        .map_err(|e| EstError::pkcs7_decode(format!("Failed to encode ContentInfo: {}", e)))
}

/// Same as [`encode_certs_only`], base64 encoded as an EST response body.
pub fn encode_certs_only_base64(certs: &[Certificate]) -> Result<String> {
    Ok(BASE64_STANDARD.encode(encode_certs_only(certs)?))
}
