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

//! Trust anchor resolution and bootstrap (TOFU) verification.
//!
//! An EST client needs a trust anchor before it can talk to the server over
//! verified TLS. The anchor is either supplied explicitly, or fetched from
//! `/cacerts` without TLS verification per RFC 7030 Section 4.1.1. An
//! implicitly fetched anchor is marked unverified until the caller confirms
//! it out-of-band, usually by comparing SHA-256 fingerprints.
//!
//! # Example
//!
//! ```no_run
//! use est_enroll_core::trust::{format_fingerprint, subject_common_name, TrustAnchor};
//!
//! # fn example(anchor: TrustAnchor) -> est_enroll_core::Result<()> {
//! for (cert, fp) in anchor.iter().zip(anchor.fingerprints()?.iter()) {
//!     println!("Certificate: {}", subject_common_name(cert).unwrap_or_default());
//!     println!("Fingerprint: {}", format_fingerprint(fp));
//! }
//! # Ok(())
//! # }
//! ```

use der::{Decode, Encode};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use crate::chain::CertificateChain;
use crate::error::{EstError, Result};
use crate::tls::ServerTrust;
use crate::transport::EstTransport;
use crate::types::pkcs7::{CmsPkcs7Decoder, Pkcs7Decoder};

/// Where a trust anchor came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorOrigin {
    /// Supplied by the caller.
    Explicit,

    /// Fetched from the server without TLS verification.
    Implicit {
        /// Whether the caller has confirmed the certificates out-of-band.
        confirmed: bool,
    },
}

/// The CA certificates the client trusts when connecting to the EST server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    certificates: Vec<Certificate>,
    origin: AnchorOrigin,
}

impl TrustAnchor {
    /// An explicit anchor over one or more certificates.
    pub fn explicit(certificates: Vec<Certificate>) -> Result<Self> {
        Self::with_origin(certificates, AnchorOrigin::Explicit)
    }

    /// An unconfirmed anchor, as produced by implicit bootstrap.
    pub fn implicit(certificates: Vec<Certificate>) -> Result<Self> {
        Self::with_origin(certificates, AnchorOrigin::Implicit { confirmed: false })
    }

    fn with_origin(certificates: Vec<Certificate>, origin: AnchorOrigin) -> Result<Self> {
        if certificates.is_empty() {
            return Err(EstError::trust_bootstrap(
                "Trust anchor must contain at least one certificate",
            ));
        }
        Ok(Self {
            certificates,
            origin,
        })
    }

    /// Parse an explicit anchor from PEM (one or more certificates) or DER.
    pub fn from_pem_or_der(data: &[u8]) -> Result<Self> {
        let certificates = if looks_like_pem(data) {
            Certificate::load_pem_chain(data).map_err(|e| {
                EstError::trust_bootstrap(format!("Failed to parse anchor PEM: {}", e))
            })?
        } else {
            vec![Certificate::from_der(data).map_err(|e| {
                EstError::trust_bootstrap(format!("Failed to parse anchor DER: {}", e))
            })?]
        };

        Self::explicit(certificates)
    }

    /// The anchor certificates.
    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    /// Iterate over the anchor certificates.
    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.iter()
    }

    /// Returns the number of certificates.
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Always false; anchors hold at least one certificate.
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Where this anchor came from.
    pub fn origin(&self) -> AnchorOrigin {
        self.origin
    }

    /// True for implicit anchors that have not been confirmed yet.
    pub fn is_unverified_origin(&self) -> bool {
        self.origin == AnchorOrigin::Implicit { confirmed: false }
    }

    /// True if the anchor may be used to verify the server.
    pub fn is_trusted(&self) -> bool {
        !self.is_unverified_origin()
    }

    /// SHA-256 fingerprints, one per certificate.
    pub fn fingerprints(&self) -> Result<Vec<[u8; 32]>> {
        self.certificates.iter().map(compute_fingerprint).collect()
    }

    /// Confirm an implicit anchor by asking `verify` about every certificate.
    ///
    /// Explicit anchors are returned unchanged. Any rejected certificate
    /// fails the whole anchor.
    pub fn confirm_with<F>(self, verify: F) -> Result<Self>
    where
        F: Fn(&Certificate, &[u8; 32]) -> bool,
    {
        if self.origin == AnchorOrigin::Explicit {
            return Ok(self);
        }

        for cert in &self.certificates {
            let fp = compute_fingerprint(cert)?;
            if !verify(cert, &fp) {
                return Err(EstError::trust_bootstrap(format!(
                    "Fingerprint verification failed for: {}",
                    subject_common_name(cert).unwrap_or_else(|| "unknown".to_string())
                )));
            }
        }

        tracing::info!(
            "Bootstrap trust anchor confirmed ({} certificate(s))",
            self.certificates.len()
        );
        Ok(Self {
            origin: AnchorOrigin::Implicit { confirmed: true },
            ..self
        })
    }

    /// Confirm an implicit anchor against known fingerprints.
    ///
    /// Every certificate's fingerprint must be among `expected`.
    pub fn confirm_fingerprints(self, expected: &[[u8; 32]]) -> Result<Self> {
        if expected.is_empty() && self.origin != AnchorOrigin::Explicit {
            return Err(EstError::trust_bootstrap(
                "No expected fingerprints supplied",
            ));
        }
        self.confirm_with(|_, fp| expected.contains(fp))
    }

    /// DER encoding of each certificate.
    pub fn to_der_vec(&self) -> Result<Vec<Vec<u8>>> {
        self.certificates
            .iter()
            .map(|cert| {
                cert.to_der().map_err(|e| {
                    EstError::trust_bootstrap(format!("Failed to encode anchor: {}", e))
                })
            })
            .collect()
    }

    /// PEM export, suitable as the explicit anchor of a later run.
    pub fn to_pem(&self) -> Result<String> {
        CertificateChain::new(self.certificates.clone()).to_pem()
    }
}

fn looks_like_pem(data: &[u8]) -> bool {
    let trimmed = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| &data[start..])
        .unwrap_or_default();
    trimmed.starts_with(b"-----BEGIN")
}

/// Resolves the trust anchor for a session.
pub struct TrustResolver<'a> {
    transport: &'a dyn EstTransport,
    decoder: &'a dyn Pkcs7Decoder,
}

impl<'a> TrustResolver<'a> {
    /// Create a resolver fetching through `transport` and decoding with `decoder`.
    pub fn new(transport: &'a dyn EstTransport, decoder: &'a dyn Pkcs7Decoder) -> Self {
        Self { transport, decoder }
    }

    /// Use `explicit` if given, otherwise bootstrap from `/cacerts`.
    pub async fn resolve(&self, explicit: Option<&[u8]>) -> Result<TrustAnchor> {
        if let Some(data) = explicit {
            let anchor = TrustAnchor::from_pem_or_der(data)?;
            tracing::debug!("Using explicit trust anchor ({} certificate(s))", anchor.len());
            return Ok(anchor);
        }

        tracing::warn!("Fetching CA certificates in bootstrap mode (no TLS verification)");

        let der = self
            .transport
            .get_ca_certs(ServerTrust::Unverified)
            .await
            .map_err(|e| EstError::trust_bootstrap(format!("Failed to fetch CA certificates: {}", e)))?;

        let chain = self
            .decoder
            .decode(&der)
            .map_err(|e| EstError::trust_bootstrap(format!("Invalid CA certificate bundle: {}", e)))?;

        let anchor = TrustAnchor::implicit(chain.into_vec())?;
        for (cert, fp) in anchor.iter().zip(anchor.fingerprints()?.iter()) {
            tracing::info!(
                "Bootstrap CA '{}' fingerprint {}",
                subject_common_name(cert).unwrap_or_else(|| "unknown".to_string()),
                format_fingerprint(fp)
            );
        }
        Ok(anchor)
    }
}

/// Resolve trust with the default PKCS#7 decoder.
pub async fn resolve_trust(
    explicit: Option<&[u8]>,
    transport: &dyn EstTransport,
) -> Result<TrustAnchor> {
    TrustResolver::new(transport, &CmsPkcs7Decoder)
        .resolve(explicit)
        .await
}

/// Compute the SHA-256 fingerprint of a certificate.
pub fn compute_fingerprint(cert: &Certificate) -> Result<[u8; 32]> {
    let der = cert
        .to_der()
        .map_err(|e| EstError::trust_bootstrap(format!("Failed to encode cert: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&der);
    Ok(hasher.finalize().into())
}

/// Format a fingerprint as a colon-separated hex string.
///
/// Example output: "AB:CD:EF:01:23:45:..."
pub fn format_fingerprint(fp: &[u8; 32]) -> String {
    fp.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse a fingerprint from a colon-separated (or plain) hex string.
pub fn parse_fingerprint(s: &str) -> Result<[u8; 32]> {
    let hex: String = s
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect();

    if hex.len() != 64 || !hex.is_ascii() {
        return Err(EstError::trust_bootstrap(
            "Fingerprint must be 32 bytes (SHA-256)",
        ));
    }

    let mut fp = [0u8; 32];
    for (i, byte) in fp.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| EstError::trust_bootstrap("Invalid fingerprint format"))?;
    }
    Ok(fp)
}

/// Get the common name from a certificate's subject.
pub fn subject_common_name(cert: &Certificate) -> Option<String> {
    use const_oid::db::rfc4519::CN;

    for rdn in cert.tbs_certificate.subject.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid == CN {
                if let Ok(s) = std::str::from_utf8(atv.value.value()) {
                    return Some(s.to_string());
                }
            }
        }
    }
    None
}
