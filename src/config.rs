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

//! Configuration types for enrollment sessions.
//!
//! This module provides the server endpoint, authentication credentials,
//! trust source, timeout, retry policy and key policy used by an
//! [`EnrollmentSession`](crate::session::EnrollmentSession).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::csr::KeySpec;
use crate::error::{EstError, Result};
use crate::tls::{parse_pem_certificates, parse_pem_private_key};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for an enrollment session.
#[derive(Clone)]
pub struct EstClientConfig {
    /// EST server base URL (e.g., "https://est.example.com:8443").
    pub server_url: Url,

    /// Optional CA label for multi-CA deployments.
    ///
    /// When set, the EST path becomes `/.well-known/est/{ca_label}/{operation}`.
    pub ca_label: Option<String>,

    /// Credential presented on `/simpleenroll`.
    pub auth: Option<AuthCredential>,

    /// Where the server trust anchor comes from.
    pub trust: TrustSource,

    /// Timeout applied to each network operation.
    pub timeout: Duration,

    /// Bounded retry behaviour for transient failures.
    pub retry: RetryPolicy,

    /// Key algorithm used when generating key pairs.
    pub key_spec: KeySpec,

    /// Whether re-enrollment keeps the current key or generates a new one.
    pub reenroll_key_policy: ReenrollKeyPolicy,

    /// Additional HTTP headers to include in requests.
    pub additional_headers: Vec<(String, String)>,

    /// Permit plain `http://` server URLs. Test servers only.
    pub allow_insecure_http: bool,
}

impl std::fmt::Debug for EstClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstClientConfig")
            .field("server_url", &self.server_url)
            .field("ca_label", &self.ca_label)
            .field("auth", &self.auth.as_ref().map(AuthCredential::mode))
            .field("trust", &self.trust)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("key_spec", &self.key_spec)
            .field("reenroll_key_policy", &self.reenroll_key_policy)
            .field("allow_insecure_http", &self.allow_insecure_http)
            .finish()
    }
}

impl EstClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> EstClientConfigBuilder {
        EstClientConfigBuilder::new()
    }

    /// The EST endpoint described by this configuration.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.server_url.clone(), self.ca_label.clone())
    }

    /// Build the EST operation URL.
    pub fn build_url(&self, operation: &str) -> Url {
        self.endpoint().url(operation)
    }
}

/// An EST server base URL plus optional CA label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
    ca_label: Option<String>,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(base: Url, ca_label: Option<String>) -> Self {
        Self { base, ca_label }
    }

    /// The server base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Returns the full URL for the given EST operation, including the optional CA label.
    pub fn url(&self, operation: &str) -> Url {
        let mut url = self.base.clone();

        let path = if let Some(ref label) = self.ca_label {
            format!("/.well-known/est/{}/{}", label, operation)
        } else {
            format!("/.well-known/est/{}", operation)
        };

        url.set_path(&path);
        url
    }
}

/// Builder for [`EstClientConfig`].
#[derive(Default)]
pub struct EstClientConfigBuilder {
    server_url: Option<Url>,
    ca_label: Option<String>,
    auth: Option<AuthCredential>,
    trust: Option<TrustSource>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    key_spec: Option<KeySpec>,
    reenroll_key_policy: Option<ReenrollKeyPolicy>,
    additional_headers: Vec<(String, String)>,
    allow_insecure_http: bool,
}

impl EstClientConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the EST server URL.
    pub fn server_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.server_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Set the EST server URL from a pre-parsed URL.
    pub fn server_url_parsed(mut self, url: Url) -> Self {
        self.server_url = Some(url);
        self
    }

    /// Set the CA label for multi-CA deployments.
    pub fn ca_label(mut self, label: impl Into<String>) -> Self {
        self.ca_label = Some(label.into());
        self
    }

    /// Use HTTP Basic authentication on `/simpleenroll`.
    pub fn http_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(AuthCredential::Basic(HttpAuth::new(username, password)));
        self
    }

    /// Use an existing certificate and key for TLS client authentication.
    pub fn client_identity(mut self, identity: ClientIdentity) -> Self {
        self.auth = Some(AuthCredential::ClientCert(identity));
        self
    }

    /// Trust only the given anchor certificate(s), PEM or DER encoded.
    pub fn trust_explicit(mut self, anchor: impl Into<Vec<u8>>) -> Self {
        self.trust = Some(TrustSource::Explicit(anchor.into()));
        self
    }

    /// Bootstrap trust from the server's own `/cacerts` bundle.
    ///
    /// The resulting anchor must be confirmed out-of-band before enrollment.
    pub fn trust_implicit(mut self) -> Self {
        self.trust = Some(TrustSource::Implicit);
        self
    }

    /// Set the per-operation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry policy.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the key algorithm for generated keys.
    pub fn key_spec(mut self, spec: KeySpec) -> Self {
        self.key_spec = Some(spec);
        self
    }

    /// Set the re-enrollment key policy.
    pub fn reenroll_key_policy(mut self, policy: ReenrollKeyPolicy) -> Self {
        self.reenroll_key_policy = Some(policy);
        self
    }

    /// Add an additional HTTP header to all requests.
    pub fn add_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.push((name.into(), value.into()));
        self
    }

    /// Allow plain HTTP server URLs (for local mock servers only).
    pub fn allow_insecure_http(mut self) -> Self {
        self.allow_insecure_http = true;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the server URL is missing, uses an unsupported
    /// scheme, or a client identity cannot be parsed.
    pub fn build(self) -> Result<EstClientConfig> {
        let server_url = self
            .server_url
            .ok_or_else(|| EstError::config("server_url is required"))?;

        match server_url.scheme() {
            "https" => {}
            "http" if self.allow_insecure_http => {
                tracing::warn!("EST server URL uses plain HTTP: {}", server_url);
            }
            "http" => {
                return Err(EstError::config(
                    "EST requires TLS; use an https:// server URL",
                ))
            }
            other => {
                return Err(EstError::config(format!(
                    "Unsupported URL scheme '{}'",
                    other
                )))
            }
        }

        if let Some(AuthCredential::ClientCert(ref identity)) = self.auth {
            identity.validate()?;
        }

        let retry = self.retry.unwrap_or_default();
        if retry.initial_backoff > retry.max_backoff {
            return Err(EstError::config(
                "initial_backoff must not exceed max_backoff",
            ));
        }

        Ok(EstClientConfig {
            server_url,
            ca_label: self.ca_label,
            auth: self.auth,
            trust: self.trust.unwrap_or(TrustSource::Implicit),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            retry,
            key_spec: self.key_spec.unwrap_or_default(),
            reenroll_key_policy: self.reenroll_key_policy.unwrap_or_default(),
            additional_headers: self.additional_headers,
            allow_insecure_http: self.allow_insecure_http,
        })
    }
}

/// How the client authenticates an enrollment request.
#[derive(Clone)]
pub enum AuthCredential {
    /// HTTP Basic authentication header.
    Basic(HttpAuth),

    /// TLS client certificate authentication.
    ClientCert(ClientIdentity),
}

impl AuthCredential {
    /// The authentication mode of this credential.
    pub fn mode(&self) -> AuthMode {
        match self {
            Self::Basic(_) => AuthMode::Basic,
            Self::ClientCert(_) => AuthMode::ClientCert,
        }
    }
}

impl std::fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic(auth) => f
                .debug_struct("Basic")
                .field("username", &auth.username)
                .finish_non_exhaustive(),
            Self::ClientCert(_) => f.write_str("ClientCert(..)"),
        }
    }
}

/// Authentication mode of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// No credential is presented.
    None,
    /// HTTP Basic.
    Basic,
    /// TLS client certificate.
    ClientCert,
}

/// Client identity for TLS client certificate authentication.
#[derive(Clone)]
pub struct ClientIdentity {
    /// PEM-encoded certificate chain.
    ///
    /// The client certificate should be first, followed by any intermediate certificates.
    pub cert_pem: Vec<u8>,

    /// PEM-encoded private key.
    pub key_pem: Vec<u8>,
}

impl ClientIdentity {
    /// Create a new client identity from PEM-encoded data.
    pub fn new(cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
        }
    }

    /// Create a client identity from file paths.
    pub fn from_files(
        cert_path: impl AsRef<std::path::Path>,
        key_path: impl AsRef<std::path::Path>,
    ) -> std::io::Result<Self> {
        let cert_pem = std::fs::read(cert_path)?;
        let key_pem = std::fs::read(key_path)?;
        Ok(Self { cert_pem, key_pem })
    }

    /// Check that both the certificate chain and the private key parse.
    pub fn validate(&self) -> Result<()> {
        parse_pem_certificates(&self.cert_pem)?;
        parse_pem_private_key(&self.key_pem)?;
        Ok(())
    }
}

/// HTTP Basic authentication credentials.
#[derive(Clone)]
pub struct HttpAuth {
    /// Username (may be empty for password-only auth).
    pub username: String,

    /// Password.
    pub password: String,
}

impl HttpAuth {
    /// Create new HTTP auth credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Source of the server trust anchor.
#[derive(Clone)]
pub enum TrustSource {
    /// Pre-shared anchor certificate(s), PEM or DER.
    Explicit(Vec<u8>),

    /// Fetch `/cacerts` without verification and confirm out-of-band.
    Implicit,
}

impl std::fmt::Debug for TrustSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit(anchor) => write!(f, "Explicit({} bytes)", anchor.len()),
            Self::Implicit => write!(f, "Implicit"),
        }
    }
}

/// Key handling on re-enrollment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReenrollKeyPolicy {
    /// Keep the current key pair (renewal).
    #[default]
    Reuse,

    /// Generate a fresh key pair (rekey).
    Regenerate,
}

/// Bounded retry behaviour for a single transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after transport failures (not counting the first attempt).
    pub max_retries: u32,

    /// Delay before the first transport retry; doubled on each further retry.
    pub initial_backoff: Duration,

    /// Upper bound on the exponential backoff delay.
    pub max_backoff: Duration,

    /// Retries after the server answered "pending" (HTTP 202).
    pub max_pending_retries: u32,

    /// Longest server-suggested delay the session is willing to wait.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_pending_retries: 3,
            max_retry_after: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            max_pending_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff delay before transport retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_backoff)
    }
}
