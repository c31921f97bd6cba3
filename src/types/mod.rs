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

//! EST message types and parsing utilities.
//!
//! This module provides the PKCS#7 certs-only codec, CSR attribute parsing,
//! and the media types and path segments of the EST endpoints.

pub mod csr_attrs;
pub mod pkcs7;

pub use csr_attrs::{CsrAttribute, CsrAttributes};
pub use pkcs7::{
    decode_pkcs7, decode_pkcs7_base64, encode_certs_only, encode_certs_only_base64,
    CmsPkcs7Decoder, Pkcs7Decoder,
};

/// Content types used in EST protocol.
pub mod content_types {
    /// PKCS#10 CSR content type.
    pub const PKCS10: &str = "application/pkcs10";

    /// PKCS#7/CMS content type.
    pub const PKCS7_MIME: &str = "application/pkcs7-mime";

    /// PKCS#7 certs-only content type with smime-type parameter.
    pub const PKCS7_CERTS_ONLY: &str = "application/pkcs7-mime; smime-type=certs-only";

    /// CSR attributes content type.
    pub const CSR_ATTRS: &str = "application/csrattrs";
}

/// EST operation paths.
pub mod operations {
    /// CA certificates endpoint.
    pub const CACERTS: &str = "cacerts";

    /// Simple enrollment endpoint.
    pub const SIMPLE_ENROLL: &str = "simpleenroll";

    /// Simple re-enrollment endpoint.
    pub const SIMPLE_REENROLL: &str = "simplereenroll";

    /// CSR attributes endpoint.
    pub const CSR_ATTRS: &str = "csrattrs";
}
