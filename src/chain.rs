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

//! Issued certificate chains.
//!
//! A [`CertificateChain`] is ordered leaf first, each certificate followed by
//! its issuer where the bundle contains it. Chains are exported as PEM for
//! storage and parsed back from PEM unchanged.

use std::fmt::Write as _;

use der::pem::LineEnding;
use der::{Encode, EncodePem};
use x509_cert::name::Name;
use x509_cert::Certificate;

use crate::error::{EstError, Result};

/// An ordered list of X.509 certificates, leaf first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    /// Wrap certificates that are already in leaf-first order.
    pub fn new(certificates: Vec<Certificate>) -> Self {
        Self { certificates }
    }

    /// Order an unordered bundle leaf first.
    ///
    /// The leaf is the first certificate that issued no other certificate in
    /// the bundle. From there issuer names are followed to subjects.
    /// Certificates that do not link into that path keep their original
    /// relative order at the end.
    pub fn from_unordered(certificates: Vec<Certificate>) -> Self {
        if certificates.len() < 2 {
            return Self { certificates };
        }

        let issued_something = |candidate: &Certificate| {
            certificates.iter().any(|other| {
                !std::ptr::eq(other, candidate)
                    && !is_self_issued(other)
                    && other.tbs_certificate.issuer == candidate.tbs_certificate.subject
            })
        };

        let leaf_index = certificates
            .iter()
            .position(|cert| !is_self_issued(cert) && !issued_something(cert))
            .or_else(|| certificates.iter().position(|cert| !issued_something(cert)))
            .unwrap_or(0);

        let mut used = vec![false; certificates.len()];
        let mut order = vec![leaf_index];
        used[leaf_index] = true;

        let mut current = leaf_index;
        while !is_self_issued(&certificates[current]) {
            let issuer = &certificates[current].tbs_certificate.issuer;
            let next = certificates
                .iter()
                .enumerate()
                .position(|(i, cert)| !used[i] && &cert.tbs_certificate.subject == issuer);

            match next {
                Some(i) => {
                    used[i] = true;
                    order.push(i);
                    current = i;
                }
                None => break,
            }
        }

        let unlinked = used.iter().filter(|u| !**u).count();
        if unlinked > 0 {
            tracing::warn!(
                "{} certificate(s) in bundle do not link to the leaf; appended unordered",
                unlinked
            );
        }
        order.extend((0..certificates.len()).filter(|i| !used[*i]));

        let mut slots: Vec<Option<Certificate>> = certificates.into_iter().map(Some).collect();
        let certificates = order
            .into_iter()
            .filter_map(|i| slots[i].take())
            .collect();

        Self { certificates }
    }

    /// Parse a PEM bundle, keeping its order.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let certificates = Certificate::load_pem_chain(pem)
            .map_err(|e| EstError::invalid_pem(format!("Failed to parse certificates: {}", e)))?;

        if certificates.is_empty() {
            return Err(EstError::invalid_pem("No certificates found in PEM data"));
        }

        Ok(Self { certificates })
    }

    /// The end-entity certificate.
    pub fn leaf(&self) -> Option<&Certificate> {
        self.certificates.first()
    }

    /// All certificates, leaf first.
    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    /// Returns the number of certificates.
    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    /// Returns true if the chain holds no certificate.
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Iterate over the certificates, leaf first.
    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.iter()
    }

    /// Consume the chain, returning its certificates.
    pub fn into_vec(self) -> Vec<Certificate> {
        self.certificates
    }

    /// Returns true if each certificate is issued by the next one.
    pub fn is_linked(&self) -> bool {
        self.certificates
            .windows(2)
            .all(|pair| pair[0].tbs_certificate.issuer == pair[1].tbs_certificate.subject)
    }

    /// DER encoding of each certificate, leaf first.
    pub fn to_der_vec(&self) -> Result<Vec<Vec<u8>>> {
        self.certificates
            .iter()
            .map(|cert| {
                cert.to_der().map_err(|e| {
                    EstError::invalid_pem(format!("Failed to encode certificate: {}", e))
                })
            })
            .collect()
    }

    /// Concatenated PEM, leaf first, 64-column base64 with LF line endings.
    pub fn to_pem(&self) -> Result<String> {
        let mut out = String::new();
        for cert in &self.certificates {
            let pem = cert.to_pem(LineEnding::LF).map_err(|e| {
                EstError::invalid_pem(format!("Failed to encode certificate: {}", e))
            })?;
            out.push_str(&pem);
        }
        Ok(out)
    }

    /// Compare the leaf subject with the subject that was requested.
    ///
    /// CAs may rewrite subjects, so a mismatch is logged and reported but is
    /// not an error.
    pub fn check_subject(&self, expected: &Name) -> bool {
        match self.leaf() {
            Some(leaf) if &leaf.tbs_certificate.subject == expected => true,
            Some(leaf) => {
                tracing::warn!(
                    "Issued certificate subject '{}' differs from requested '{}'",
                    leaf.tbs_certificate.subject,
                    expected
                );
                false
            }
            None => false,
        }
    }

    /// Human-readable subject and issuer of every certificate.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, cert) in self.certificates.iter().enumerate() {
            let _ = writeln!(out, "[{}] subject: {}", i, cert.tbs_certificate.subject);
            let _ = writeln!(out, "    issuer:  {}", cert.tbs_certificate.issuer);
        }
        out
    }
}

impl IntoIterator for CertificateChain {
    type Item = Certificate;
    type IntoIter = std::vec::IntoIter<Certificate>;

    fn into_iter(self) -> Self::IntoIter {
        self.certificates.into_iter()
    }
}

impl<'a> IntoIterator for &'a CertificateChain {
    type Item = &'a Certificate;
    type IntoIter = std::slice::Iter<'a, Certificate>;

    fn into_iter(self) -> Self::IntoIter {
        self.certificates.iter()
    }
}

fn is_self_issued(cert: &Certificate) -> bool {
    cert.tbs_certificate.issuer == cert.tbs_certificate.subject
}
