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

//! CSR Attributes parsing.
//!
//! This module handles parsing of the CSR Attributes response from the
//! /csrattrs endpoint as defined in RFC 7030 Section 4.5.
//!
//! ```text
//! CsrAttrs ::= SEQUENCE SIZE (0..MAX) OF AttrOrOID
//! AttrOrOID ::= CHOICE { oid OBJECT IDENTIFIER, attribute Attribute }
//! ```

use base64::prelude::*;
use const_oid::ObjectIdentifier;
use der::{Any, Decode, Encode, Tag, Tagged};
use x509_cert::attr::Attribute;

use crate::error::{EstError, Result};

/// CSR Attributes returned from the /csrattrs endpoint.
///
/// These attributes indicate what the EST server expects to see in
/// Certificate Signing Requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsrAttributes {
    /// Requested attributes, in server order.
    pub attributes: Vec<CsrAttribute>,
}

/// A single CSR attribute from the /csrattrs response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrAttribute {
    /// The attribute OID.
    pub oid: ObjectIdentifier,

    /// Optional attribute values (DER-encoded).
    pub values: Vec<Vec<u8>>,
}

impl CsrAttributes {
    /// Create a new empty CSR attributes collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse CSR attributes from a base64-encoded response body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let cleaned: Vec<u8> = body
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();

        if cleaned.is_empty() {
            return Ok(Self::new());
        }

        let der_bytes = BASE64_STANDARD
            .decode(&cleaned)
            .map_err(|e| EstError::csr_attrs_decode(format!("Invalid base64 body: {}", e)))?;

        Self::from_der(&der_bytes)
    }

    /// Parse CSR attributes from DER-encoded data.
    pub fn from_der(data: &[u8]) -> Result<Self> {
        let elements = Vec::<Any>::from_der(data)
            .map_err(|e| EstError::csr_attrs_decode(format!("Expected SEQUENCE OF AttrOrOID: {}", e)))?;

        let mut attributes = Vec::with_capacity(elements.len());
        for element in elements {
            match element.tag() {
                Tag::ObjectIdentifier => {
                    let oid = element.decode_as::<ObjectIdentifier>().map_err(|e| {
                        EstError::csr_attrs_decode(format!("Failed to parse OID: {}", e))
                    })?;
                    attributes.push(CsrAttribute::new(oid));
                }
                Tag::Sequence => {
                    let attr = Attribute::from_der(&element.to_der().map_err(|e| {
                        EstError::csr_attrs_decode(format!("Failed to re-encode attribute: {}", e))
                    })?)
                    .map_err(|e| {
                        EstError::csr_attrs_decode(format!("Failed to parse attribute: {}", e))
                    })?;

                    let values = attr
                        .values
                        .iter()
                        .map(|v| v.to_der())
                        .collect::<der::Result<Vec<_>>>()
                        .map_err(|e| EstError::csr_attrs_decode(e.to_string()))?;
                    attributes.push(CsrAttribute::with_values(attr.oid, values));
                }
                other => {
                    tracing::warn!("Skipping unexpected CSR attribute element with tag {}", other);
                }
            }
        }

        Ok(Self { attributes })
    }

    /// Returns true if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Returns the number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Check if a specific OID is requested.
    pub fn contains_oid(&self, oid: &ObjectIdentifier) -> bool {
        self.attributes.iter().any(|attr| &attr.oid == oid)
    }

    /// Get all attribute OIDs.
    pub fn oids(&self) -> Vec<ObjectIdentifier> {
        self.attributes.iter().map(|a| a.oid).collect()
    }
}

impl CsrAttribute {
    /// Create a new CSR attribute with just an OID.
    pub fn new(oid: ObjectIdentifier) -> Self {
        Self {
            oid,
            values: Vec::new(),
        }
    }

    /// Create a new CSR attribute with OID and values.
    pub fn with_values(oid: ObjectIdentifier, values: Vec<Vec<u8>>) -> Self {
        Self { oid, values }
    }

    /// Check if this attribute has any values.
    pub fn has_values(&self) -> bool {
        !self.values.is_empty()
    }

    /// Short name for well-known OIDs.
    pub fn name(&self) -> Option<&'static str> {
        oids::name(&self.oid)
    }
}

/// Well-known OIDs used in CSR attributes.
pub mod oids {
    use const_oid::ObjectIdentifier;

    /// Challenge Password OID (1.2.840.113549.1.9.7)
    pub const CHALLENGE_PASSWORD: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.7");

    /// Extension Request OID (1.2.840.113549.1.9.14)
    pub const EXTENSION_REQUEST: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

    /// EC public key OID (1.2.840.10045.2.1)
    pub const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

    /// secp384r1 curve OID (1.3.132.0.34)
    pub const SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

    /// ecdsa-with-SHA384 OID (1.2.840.10045.4.3.3)
    pub const ECDSA_WITH_SHA384: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");

    /// Subject Alternative Name OID (2.5.29.17)
    pub const SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

    /// Key Usage OID (2.5.29.15)
    pub const KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");

    /// Extended Key Usage OID (2.5.29.37)
    pub const EXTENDED_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");

    pub(super) fn name(oid: &ObjectIdentifier) -> Option<&'static str> {
        let name = match *oid {
            CHALLENGE_PASSWORD => "challengePassword",
            EXTENSION_REQUEST => "extensionRequest",
            EC_PUBLIC_KEY => "id-ecPublicKey",
            SECP384R1 => "secp384r1",
            ECDSA_WITH_SHA384 => "ecdsa-with-SHA384",
            SUBJECT_ALT_NAME => "subjectAltName",
            KEY_USAGE => "keyUsage",
            EXTENDED_KEY_USAGE => "extKeyUsage",
            _ => return None,
        };
        Some(name)
    }
}
