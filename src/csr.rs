// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CSR (Certificate Signing Request) generation.
//!
//! Key pairs are generated per [`KeySpec`] and PKCS#10 requests are signed
//! with them. The subject is always written in the order
//! C, ST, L, O, OU, CN, emailAddress, skipping absent fields, so that two
//! requests for the same [`Identity`] carry identical subjects.
//!
//! # Example
//!
//! ```no_run
//! use est_enroll_core::csr::{build_csr, Identity, KeySpec};
//!
//! let identity = Identity::new("device.example.com")
//!     .organization("Example Corp")
//!     .country("US");
//! let (key, csr) = build_csr(&identity, KeySpec::EcdsaP256).expect("CSR");
//! println!("{}", csr.to_pem().expect("PEM"));
//! # drop(key);
//! ```

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use const_oid::{AssociatedOid, ObjectIdentifier};
use der::asn1::Any;
use der::pem::LineEnding;
use der::{Decode, Encode, Tag, Tagged};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, Ia5String, PrintableString, SanType,
    TeletexString,
};
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;
use serde::{Deserialize, Serialize};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::name::Name;
use x509_cert::request::CertReq;
use x509_cert::Certificate;

use crate::error::{EstError, Result};

/// OID 2.5.4.6 (countryName).
pub const OID_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
/// OID 2.5.4.8 (stateOrProvinceName).
pub const OID_STATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
/// OID 2.5.4.7 (localityName).
pub const OID_LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
/// OID 2.5.4.10 (organizationName).
pub const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
/// OID 2.5.4.11 (organizationalUnitName).
pub const OID_ORGANIZATIONAL_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");
/// OID 2.5.4.3 (commonName).
pub const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
/// OID 1.2.840.113549.1.9.1 (emailAddress).
pub const OID_EMAIL_ADDRESS: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.1");

const EMAIL_ADDRESS_ARCS: [u64; 7] = [1, 2, 840, 113549, 1, 9, 1];

/// Subject attributes requested for the certificate.
///
/// Only `common_name` is mandatory. Identities compare by value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Identity {
    /// Common Name (CN).
    pub common_name: String,
    /// Two-letter country code (C).
    #[serde(default)]
    pub country: Option<String>,
    /// State or province (ST).
    #[serde(default)]
    pub state: Option<String>,
    /// Locality or city (L).
    #[serde(default)]
    pub city: Option<String>,
    /// Organization (O).
    #[serde(default)]
    pub organization: Option<String>,
    /// Organizational unit (OU).
    #[serde(default)]
    pub organizational_unit: Option<String>,
    /// Email address.
    #[serde(default)]
    pub email_address: Option<String>,
}

impl Identity {
    /// Create an identity with only a common name.
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            ..Self::default()
        }
    }

    /// Set the country (C).
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Set the state or province (ST).
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Set the locality (L).
    pub fn city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    /// Set the organization (O).
    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// Set the organizational unit (OU).
    pub fn organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = Some(unit.into());
        self
    }

    /// Set the email address.
    pub fn email_address(mut self, email: impl Into<String>) -> Self {
        self.email_address = Some(email.into());
        self
    }

    /// Check the fields that have format constraints.
    pub fn validate(&self) -> Result<()> {
        if self.common_name.trim().is_empty() {
            return Err(EstError::csr_build("commonName must not be empty"));
        }

        if let Some(country) = present(&self.country) {
            if country.chars().count() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(EstError::csr_build(format!(
                    "country must be a two-letter code, got '{}'",
                    country
                )));
            }
        }

        if let Some(email) = present(&self.email_address) {
            if !email.is_ascii() {
                return Err(EstError::csr_build(format!(
                    "emailAddress must be ASCII, got '{}'",
                    email
                )));
            }
        }

        Ok(())
    }

    fn distinguished_name(&self) -> Result<DistinguishedName> {
        let mut dn = DistinguishedName::new();

        if let Some(country) = present(&self.country) {
            let value = PrintableString::try_from(country.to_ascii_uppercase())
                .map_err(|e| EstError::csr_build(format!("Invalid country: {}", e)))?;
            dn.push(DnType::CountryName, DnValue::PrintableString(value));
        }
        if let Some(state) = present(&self.state) {
            dn.push(DnType::StateOrProvinceName, state);
        }
        if let Some(city) = present(&self.city) {
            dn.push(DnType::LocalityName, city);
        }
        if let Some(org) = present(&self.organization) {
            dn.push(DnType::OrganizationName, org);
        }
        if let Some(unit) = present(&self.organizational_unit) {
            dn.push(DnType::OrganizationalUnitName, unit);
        }
        dn.push(DnType::CommonName, self.common_name.trim());
        if let Some(email) = present(&self.email_address) {
            let value = Ia5String::try_from(email)
                .map_err(|e| EstError::csr_build(format!("Invalid emailAddress: {}", e)))?;
            dn.push(
                DnType::CustomDnType(EMAIL_ADDRESS_ARCS.to_vec()),
                DnValue::Ia5String(value),
            );
        }

        Ok(dn)
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

/// Copy an issued subject attribute for attribute, keeping each string type.
///
/// rcgen writes one attribute per RDN and keys entries by type, so
/// multi-valued RDNs and repeated attribute types cannot be reproduced.
fn copy_distinguished_name(name: &Name) -> Result<DistinguishedName> {
    let mut dn = DistinguishedName::new();
    let mut seen = HashSet::new();

    for rdn in name.0.iter() {
        if rdn.0.len() != 1 {
            return Err(EstError::csr_build(format!(
                "Cannot reproduce multi-valued RDN in subject '{}'",
                name
            )));
        }
        for atv in rdn.0.iter() {
            if !seen.insert(atv.oid) {
                return Err(EstError::csr_build(format!(
                    "Cannot reproduce repeated attribute {} in subject '{}'",
                    atv.oid, name
                )));
            }
            let arcs = atv.oid.arcs().map(u64::from).collect();
            dn.push(DnType::CustomDnType(arcs), copy_dn_value(&atv.value)?);
        }
    }

    Ok(dn)
}

fn copy_dn_value(value: &Any) -> Result<DnValue> {
    let text = std::str::from_utf8(value.value())
        .map_err(|e| EstError::csr_build(format!("Subject attribute is not text: {}", e)))?;
    let invalid =
        |e: rcgen::Error| EstError::csr_build(format!("Invalid subject attribute: {}", e));

    Ok(match value.tag() {
        Tag::Utf8String => DnValue::Utf8String(text.to_string()),
        Tag::PrintableString => {
            DnValue::PrintableString(PrintableString::try_from(text).map_err(invalid)?)
        }
        Tag::Ia5String => DnValue::Ia5String(Ia5String::try_from(text).map_err(invalid)?),
        Tag::TeletexString => {
            DnValue::TeletexString(TeletexString::try_from(text).map_err(invalid)?)
        }
        other => {
            return Err(EstError::csr_build(format!(
                "Unsupported subject attribute encoding {}",
                other
            )))
        }
    })
}

fn copy_subject_alt_names(cert: &Certificate) -> Result<Vec<SanType>> {
    let mut names = Vec::new();
    let extensions = cert.tbs_certificate.extensions.iter().flatten();

    for ext in extensions.filter(|ext| ext.extn_id == SubjectAltName::OID) {
        let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
            .map_err(|e| EstError::csr_build(format!("Invalid subjectAltName: {}", e)))?;
        for name in san.0 {
            let ia5 = |text: String| {
                Ia5String::try_from(text)
                    .map_err(|e| EstError::csr_build(format!("Invalid subjectAltName: {}", e)))
            };
            match name {
                GeneralName::DnsName(dns) => names.push(SanType::DnsName(ia5(dns.to_string())?)),
                GeneralName::Rfc822Name(email) => {
                    names.push(SanType::Rfc822Name(ia5(email.to_string())?))
                }
                GeneralName::UniformResourceIdentifier(uri) => {
                    names.push(SanType::URI(ia5(uri.to_string())?))
                }
                GeneralName::IpAddress(ip) => match ip.as_bytes() {
                    [a, b, c, d] => {
                        let v4 = Ipv4Addr::new(*a, *b, *c, *d);
                        names.push(SanType::IpAddress(IpAddr::V4(v4)));
                    }
                    bytes => match <[u8; 16]>::try_from(bytes) {
                        Ok(octets) => {
                            names.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::from(octets))))
                        }
                        Err(_) => tracing::warn!("Skipping malformed iPAddress subjectAltName"),
                    },
                },
                _ => tracing::warn!("Skipping unsupported subjectAltName entry"),
            }
        }
    }

    Ok(names)
}

/// Key algorithm for generated key pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum KeySpec {
    /// ECDSA on NIST P-256 with SHA-256.
    #[default]
    EcdsaP256,
    /// ECDSA on NIST P-384 with SHA-384.
    EcdsaP384,
    /// Ed25519.
    Ed25519,
    /// RSA with SHA-256; `bits` is 2048, 3072 or 4096.
    Rsa {
        /// Modulus size in bits.
        bits: usize,
    },
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EcdsaP256 => f.write_str("ecdsa-p256"),
            Self::EcdsaP384 => f.write_str("ecdsa-p384"),
            Self::Ed25519 => f.write_str("ed25519"),
            Self::Rsa { bits } => write!(f, "rsa-{}", bits),
        }
    }
}

impl FromStr for KeySpec {
    type Err = EstError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ecdsa-p256" | "p256" | "ec" => Ok(Self::EcdsaP256),
            "ecdsa-p384" | "p384" => Ok(Self::EcdsaP384),
            "ed25519" => Ok(Self::Ed25519),
            "rsa" | "rsa-2048" => Ok(Self::Rsa { bits: 2048 }),
            "rsa-3072" => Ok(Self::Rsa { bits: 3072 }),
            "rsa-4096" => Ok(Self::Rsa { bits: 4096 }),
            other => Err(EstError::config(format!("Unknown key type '{}'", other))),
        }
    }
}

/// A private key owned by the enrollment session.
pub struct KeyPair {
    inner: rcgen::KeyPair,
    spec: KeySpec,
}

impl KeyPair {
    /// Generate a new key pair.
    pub fn generate(spec: KeySpec) -> Result<Self> {
        let inner = match spec {
            KeySpec::EcdsaP256 => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256),
            KeySpec::EcdsaP384 => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384),
            KeySpec::Ed25519 => rcgen::KeyPair::generate_for(&rcgen::PKCS_ED25519),
            KeySpec::Rsa { bits } => return Self::generate_rsa(bits),
        }
        .map_err(|e| EstError::csr_build(format!("Failed to generate key pair: {}", e)))?;

        Ok(Self { inner, spec })
    }

    // ring cannot generate RSA keys, so the rsa crate produces the PKCS#8
    // document that rcgen then loads for signing.
    fn generate_rsa(bits: usize) -> Result<Self> {
        if !matches!(bits, 2048 | 3072 | 4096) {
            return Err(EstError::csr_build(format!(
                "Unsupported RSA key size: {}",
                bits
            )));
        }

        let private = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
            .map_err(|e| EstError::csr_build(format!("Failed to generate RSA key: {}", e)))?;
        let pkcs8 = private
            .to_pkcs8_der()
            .map_err(|e| EstError::csr_build(format!("Failed to encode RSA key: {}", e)))?;
        let der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
        let inner = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&der, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| EstError::csr_build(format!("Failed to load RSA key: {}", e)))?;

        Ok(Self {
            inner,
            spec: KeySpec::Rsa { bits },
        })
    }

    /// Load a PKCS#8 PEM private key.
    pub fn from_pkcs8_pem(pem: &str, spec: KeySpec) -> Result<Self> {
        let inner = match spec {
            KeySpec::Rsa { .. } => {
                rcgen::KeyPair::from_pem_and_sign_algo(pem, &rcgen::PKCS_RSA_SHA256)
            }
            _ => rcgen::KeyPair::from_pem(pem),
        }
        .map_err(|e| EstError::invalid_pem(format!("Failed to load private key: {}", e)))?;

        Ok(Self { inner, spec })
    }

    /// The algorithm of this key.
    pub fn spec(&self) -> KeySpec {
        self.spec
    }

    /// PKCS#8 private key, PEM encoded.
    pub fn private_key_pem(&self) -> String {
        self.inner.serialize_pem()
    }

    /// PKCS#8 private key, DER encoded.
    pub fn private_key_der(&self) -> Vec<u8> {
        self.inner.serialize_der()
    }

    /// SubjectPublicKeyInfo, DER encoded.
    pub fn public_key_der(&self) -> Vec<u8> {
        self.inner.public_key_der()
    }

    pub(crate) fn rcgen(&self) -> &rcgen::KeyPair {
        &self.inner
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// A DER-encoded PKCS#10 certification request.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    der: Vec<u8>,
}

impl CertificateRequest {
    /// Wrap DER bytes, checking that they parse as PKCS#10.
    pub fn from_der(der: impl Into<Vec<u8>>) -> Result<Self> {
        let der = der.into();
        CertReq::from_der(&der)
            .map_err(|e| EstError::csr_build(format!("Invalid PKCS#10 request: {}", e)))?;
        Ok(Self { der })
    }

    /// The DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// PEM with the `CERTIFICATE REQUEST` label.
    pub fn to_pem(&self) -> Result<String> {
        der::pem::encode_string("CERTIFICATE REQUEST", LineEnding::LF, &self.der)
            .map_err(|e| EstError::invalid_pem(e.to_string()))
    }

    /// The subject name of the request.
    pub fn subject(&self) -> Result<Name> {
        let req = CertReq::from_der(&self.der)
            .map_err(|e| EstError::csr_build(format!("Invalid PKCS#10 request: {}", e)))?;
        Ok(req.info.subject)
    }

    /// The SubjectPublicKeyInfo of the request, DER encoded.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let req = CertReq::from_der(&self.der)
            .map_err(|e| EstError::csr_build(format!("Invalid PKCS#10 request: {}", e)))?;
        req.info
            .public_key
            .to_der()
            .map_err(|e| EstError::csr_build(e.to_string()))
    }
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateRequest({} bytes)", self.der.len())
    }
}

/// Encodes and signs a PKCS#10 request for an identity.
pub trait CsrEncoder: Send + Sync {
    /// Build a request for `identity` signed with `key`.
    fn encode(&self, identity: &Identity, key: &KeyPair) -> Result<CertificateRequest>;

    /// Build a renewal request for `current`, signed with `key`.
    ///
    /// The subject and subjectAltName are those of `current` (RFC 7030
    /// Section 4.2.2), whatever the server rewrote at issuance.
    fn encode_renewal(&self, current: &Certificate, key: &KeyPair) -> Result<CertificateRequest>;
}

/// [`CsrEncoder`] backed by `rcgen`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenCsrEncoder;

impl CsrEncoder for RcgenCsrEncoder {
    fn encode(&self, identity: &Identity, key: &KeyPair) -> Result<CertificateRequest> {
        identity.validate()?;

        let mut params = CertificateParams::default();
        params.distinguished_name = identity.distinguished_name()?;
        serialize_request(&params, key)
    }

    fn encode_renewal(&self, current: &Certificate, key: &KeyPair) -> Result<CertificateRequest> {
        let mut params = CertificateParams::default();
        params.distinguished_name = copy_distinguished_name(&current.tbs_certificate.subject)?;
        params.subject_alt_names = copy_subject_alt_names(current)?;
        serialize_request(&params, key)
    }
}

fn serialize_request(params: &CertificateParams, key: &KeyPair) -> Result<CertificateRequest> {
    let csr = params
        .serialize_request(key.rcgen())
        .map_err(|e| EstError::csr_build(format!("Failed to serialize CSR: {}", e)))?;

    Ok(CertificateRequest {
        der: csr.der().to_vec(),
    })
}

/// Generate a key pair and a signed request for `identity`.
pub fn build_csr(identity: &Identity, spec: KeySpec) -> Result<(KeyPair, CertificateRequest)> {
    build_csr_using(&RcgenCsrEncoder, identity, spec)
}

/// Build a request for `identity` signed with an existing key.
pub fn build_csr_with_key(identity: &Identity, key: &KeyPair) -> Result<CertificateRequest> {
    RcgenCsrEncoder.encode(identity, key)
}

/// Build a renewal request carrying the subject and subjectAltName of
/// `current`, signed with `key`.
pub fn build_renewal_csr(current: &Certificate, key: &KeyPair) -> Result<CertificateRequest> {
    RcgenCsrEncoder.encode_renewal(current, key)
}

/// Like [`build_csr`], with a caller-supplied encoder.
pub fn build_csr_using(
    encoder: &dyn CsrEncoder,
    identity: &Identity,
    spec: KeySpec,
) -> Result<(KeyPair, CertificateRequest)> {
    // Reject bad identities before paying for key generation.
    identity.validate()?;

    let key = KeyPair::generate(spec)?;
    let csr = encoder.encode(identity, &key)?;
    tracing::debug!(
        "Built CSR for CN={} with {} key ({} bytes)",
        identity.common_name,
        spec,
        csr.der().len()
    );
    Ok((key, csr))
}
