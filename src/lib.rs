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

//! # est-enroll-core
//!
//! The client side of RFC 7030 EST (Enrollment over Secure Transport)
//! certificate enrollment, organized as an explicit state machine.
//!
//! A device establishes trust in the EST server, builds a PKCS#10 request,
//! submits it, and receives an issued certificate chain:
//!
//! - **Trust**: an explicit pre-shared anchor, or a trust-on-first-use
//!   bootstrap from `/cacerts` confirmed by fingerprint
//! - **CSR**: key generation (ECDSA P-256/P-384, Ed25519, RSA) and a
//!   fixed-order subject built with `rcgen`
//! - **Enrollment**: `/simpleenroll` and `/simplereenroll` with HTTP Basic or
//!   TLS client certificate authentication
//! - **Retries**: bounded exponential backoff for transport failures and
//!   Retry-After handling for pending (HTTP 202) answers
//! - **Cancellation**: every network wait observes a
//!   [`CancellationToken`](tokio_util::sync::CancellationToken)
//!
//! ## Quick Start
//!
//! ```no_run
//! use est_enroll_core::csr::Identity;
//! use est_enroll_core::{EnrollmentSession, EstClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EstClientConfig::builder()
//!         .server_url("https://est.example.com")?
//!         .http_auth("device001", "secret")
//!         .build()?;
//!
//!     let mut session = EnrollmentSession::new(config);
//!
//!     // No explicit anchor: fetch /cacerts and check it out-of-band.
//!     let anchor = session.resolve_trust().await?;
//!     for fp in anchor.fingerprints()? {
//!         println!("CA fingerprint: {}", est_enroll_core::trust::format_fingerprint(&fp));
//!     }
//!     session.confirm_trust_with(|_cert, _fp| true)?;
//!
//!     session.build_csr(Identity::new("device001.example.com").country("US"))?;
//!     session.simple_enroll().await?;
//!
//!     let outcome = session.finish()?;
//!     println!("{}", outcome.pem);
//!     Ok(())
//! }
//! ```
//!
//! ## Lower-level pieces
//!
//! The building blocks are usable on their own: [`csr::build_csr`],
//! [`types::decode_pkcs7`], [`chain::CertificateChain`], and the
//! [`transport::EstTransport`] seam with its HTTPS implementation.
//!
//! TLS requirements per RFC 7030 Section 3.3:
//! - TLS 1.2 or later required
//! - Only the session trust anchor is trusted; no system roots

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod chain;
pub mod config;
pub mod csr;
pub mod error;
pub mod session;
pub mod settings;
pub mod tls;
pub mod transport;
pub mod trust;
pub mod types;


// Re-export main types at crate root for convenience
pub use chain::CertificateChain;
pub use config::{
    AuthCredential, ClientIdentity, EstClientConfig, EstClientConfigBuilder, HttpAuth,
    ReenrollKeyPolicy, RetryPolicy, TrustSource,
};
pub use csr::{build_csr, CertificateRequest, Identity, KeyPair, KeySpec};
pub use error::{ErrorKind, EstError, Result};
pub use session::{EnrollmentOutcome, EnrollmentSession, SessionState, TerminalState};
pub use settings::EstSettings;
pub use trust::{AnchorOrigin, TrustAnchor};
pub use types::{decode_pkcs7, CsrAttributes};

// Re-export x509_cert::Certificate for convenience
pub use x509_cert::Certificate;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent string for HTTP requests.
pub const USER_AGENT: &str = concat!("est-enroll-core/", env!("CARGO_PKG_VERSION"));
