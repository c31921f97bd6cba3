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

//! The enrollment state machine.
//!
//! An [`EnrollmentSession`] drives one enrollment from trust resolution to
//! an issued chain:
//!
//! ```text
//! Init -> TrustResolved -> CsrReady -> Enrolled -> Terminal(Success)
//!                                         |  ^
//!                          prepare_reenroll  simple_reenroll
//!                                         v  |
//!                                     ReenrollReady
//! ```
//!
//! Any failed transition moves the session to `Terminal(Failed)`, after which
//! every operation is rejected with [`EstError::InvalidState`]. Calling an
//! operation in the wrong state is rejected the same way, without touching
//! the network and without changing state.
//!
//! Transport failures are retried with exponential backoff, and HTTP 202
//! answers are retried after the server's Retry-After delay, both bounded by
//! the session's [`RetryPolicy`](crate::config::RetryPolicy). Retries always
//! resubmit the same CSR bytes.
//!
//! # Example
//!
//! ```no_run
//! use est_enroll_core::csr::Identity;
//! use est_enroll_core::{EnrollmentSession, EstClientConfig};
//!
//! # async fn example(anchor_pem: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = EstClientConfig::builder()
//!     .server_url("https://est.example.com")?
//!     .trust_explicit(anchor_pem)
//!     .http_auth("device001", "secret")
//!     .build()?;
//!
//! let mut session = EnrollmentSession::new(config);
//! session.resolve_trust().await?;
//! session.build_csr(Identity::new("device001.example.com"))?;
//! session.simple_enroll().await?;
//!
//! let outcome = session.finish()?;
//! std::fs::write("device001.pem", &outcome.pem)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use x509_cert::Certificate;

use crate::chain::CertificateChain;
use crate::config::{AuthCredential, ClientIdentity, EstClientConfig, ReenrollKeyPolicy, TrustSource};
use crate::csr::{build_csr_using, CertificateRequest, CsrEncoder, Identity, KeyPair, RcgenCsrEncoder};
use crate::error::{ErrorKind, EstError, Result};
use crate::tls::ServerTrust;
use crate::transport::{EstTransport, HttpTransport, DEFAULT_RETRY_AFTER_SECS};
use crate::trust::{TrustAnchor, TrustResolver};
use crate::types::pkcs7::{CmsPkcs7Decoder, Pkcs7Decoder};
use crate::types::CsrAttributes;

/// Operation names reported in [`EstError::InvalidState`].
pub mod ops {
    /// [`EnrollmentSession::resolve_trust`](super::EnrollmentSession::resolve_trust)
    pub const RESOLVE_TRUST: &str = "resolve_trust";
    /// [`EnrollmentSession::confirm_trust_with`](super::EnrollmentSession::confirm_trust_with)
    pub const CONFIRM_TRUST: &str = "confirm_trust";
    /// [`EnrollmentSession::request_csr_attrs`](super::EnrollmentSession::request_csr_attrs)
    pub const REQUEST_CSR_ATTRS: &str = "request_csr_attrs";
    /// [`EnrollmentSession::build_csr`](super::EnrollmentSession::build_csr)
    pub const BUILD_CSR: &str = "build_csr";
    /// [`EnrollmentSession::simple_enroll`](super::EnrollmentSession::simple_enroll)
    pub const SIMPLE_ENROLL: &str = "simple_enroll";
    /// [`EnrollmentSession::prepare_reenroll`](super::EnrollmentSession::prepare_reenroll)
    pub const PREPARE_REENROLL: &str = "prepare_reenroll";
    /// [`EnrollmentSession::simple_reenroll`](super::EnrollmentSession::simple_reenroll)
    pub const SIMPLE_REENROLL: &str = "simple_reenroll";
    /// [`EnrollmentSession::finish`](super::EnrollmentSession::finish)
    pub const FINISH: &str = "finish";
}

/// State of an enrollment session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing done yet.
    Init,
    /// A trust anchor is available.
    TrustResolved,
    /// A key pair and CSR exist.
    CsrReady,
    /// A certificate chain has been issued.
    Enrolled,
    /// A re-enrollment CSR has been prepared.
    ReenrollReady,
    /// The session is over.
    Terminal(TerminalState),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalState {
    /// The outcome was handed to the caller.
    Success,
    /// A transition failed.
    Failed(SessionFailure),
}

/// The error that terminated a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFailure {
    /// Classification of the originating error.
    pub kind: ErrorKind,
    /// Display text of the originating error.
    pub message: String,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("Init"),
            Self::TrustResolved => f.write_str("TrustResolved"),
            Self::CsrReady => f.write_str("CsrReady"),
            Self::Enrolled => f.write_str("Enrolled"),
            Self::ReenrollReady => f.write_str("ReenrollReady"),
            Self::Terminal(TerminalState::Success) => f.write_str("Terminal(Success)"),
            Self::Terminal(TerminalState::Failed(failure)) => {
                write!(f, "Terminal(Failed: {})", failure.kind)
            }
        }
    }
}

/// Everything a successful enrollment produces.
#[derive(Debug)]
pub struct EnrollmentOutcome {
    /// The issued chain, leaf first.
    pub chain: CertificateChain,
    /// The private key matching the leaf.
    pub key: KeyPair,
    /// The chain as PEM.
    pub pem: String,
    /// The anchor the server was verified against.
    pub trust_anchor: TrustAnchor,
}

#[derive(Clone, Copy)]
enum Submission {
    Enroll,
    Reenroll,
}

impl Submission {
    fn operation(self) -> &'static str {
        match self {
            Self::Enroll => ops::SIMPLE_ENROLL,
            Self::Reenroll => ops::SIMPLE_REENROLL,
        }
    }
}

/// One enrollment against one EST server.
pub struct EnrollmentSession {
    config: EstClientConfig,
    transport: Arc<dyn EstTransport>,
    csr_encoder: Arc<dyn CsrEncoder>,
    decoder: Arc<dyn Pkcs7Decoder>,
    cancel: CancellationToken,
    state: SessionState,
    anchor: Option<TrustAnchor>,
    csr_attrs: Option<CsrAttributes>,
    identity: Option<Identity>,
    key: Option<KeyPair>,
    csr: Option<CertificateRequest>,
    chain: Option<CertificateChain>,
    pending_key: Option<KeyPair>,
    reenroll_auth: Option<AuthCredential>,
}

impl fmt::Debug for EnrollmentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentSession")
            .field("endpoint", &self.config.server_url.as_str())
            .field("auth_mode", &self.auth_mode())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl EnrollmentSession {
    /// Create a session talking HTTPS to the configured server.
    pub fn new(config: EstClientConfig) -> Self {
        let transport = Arc::new(HttpTransport::from_config(&config));
        Self::with_transport(config, transport)
    }

    /// Create a session over a caller-supplied transport.
    pub fn with_transport(config: EstClientConfig, transport: Arc<dyn EstTransport>) -> Self {
        Self {
            config,
            transport,
            csr_encoder: Arc::new(RcgenCsrEncoder),
            decoder: Arc::new(CmsPkcs7Decoder),
            cancel: CancellationToken::new(),
            state: SessionState::Init,
            anchor: None,
            csr_attrs: None,
            identity: None,
            key: None,
            csr: None,
            chain: None,
            pending_key: None,
            reenroll_auth: None,
        }
    }

    /// Replace the CSR encoder.
    pub fn with_csr_encoder(mut self, encoder: Arc<dyn CsrEncoder>) -> Self {
        self.csr_encoder = encoder;
        self
    }

    /// Replace the PKCS#7 decoder.
    pub fn with_decoder(mut self, decoder: Arc<dyn Pkcs7Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Observe `token` for cancellation instead of a private one.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels this session when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the session. In-flight requests are dropped.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// True once the session has succeeded or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Terminal(_))
    }

    /// The error that failed the session, if any.
    pub fn failure(&self) -> Option<&SessionFailure> {
        match &self.state {
            SessionState::Terminal(TerminalState::Failed(failure)) => Some(failure),
            _ => None,
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &EstClientConfig {
        &self.config
    }

    /// The resolved trust anchor.
    pub fn trust_anchor(&self) -> Option<&TrustAnchor> {
        self.anchor.as_ref()
    }

    /// Attributes returned by `/csrattrs`, if requested.
    pub fn csr_attributes(&self) -> Option<&CsrAttributes> {
        self.csr_attrs.as_ref()
    }

    /// The identity passed to [`build_csr`](Self::build_csr).
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// The current CSR.
    pub fn csr(&self) -> Option<&CertificateRequest> {
        self.csr.as_ref()
    }

    /// The most recently issued chain.
    pub fn chain(&self) -> Option<&CertificateChain> {
        self.chain.as_ref()
    }

    /// How the next enrollment request authenticates.
    pub fn auth_mode(&self) -> crate::config::AuthMode {
        match (&self.state, &self.reenroll_auth, &self.config.auth) {
            (SessionState::ReenrollReady, Some(auth), _) => auth.mode(),
            (_, _, Some(auth)) => auth.mode(),
            _ => crate::config::AuthMode::None,
        }
    }

    /// Resolve the trust anchor. `Init -> TrustResolved`.
    ///
    /// An explicit anchor from the configuration is parsed locally. Otherwise
    /// `/cacerts` is fetched without TLS verification and the resulting
    /// anchor must be confirmed before enrollment.
    pub async fn resolve_trust(&mut self) -> Result<&TrustAnchor> {
        self.ensure(ops::RESOLVE_TRUST, matches!(self.state, SessionState::Init))?;

        let explicit = match &self.config.trust {
            TrustSource::Explicit(data) => Some(data.clone()),
            TrustSource::Implicit => None,
        };

        let result = {
            let resolver = TrustResolver::new(self.transport.as_ref(), self.decoder.as_ref());
            self.cancellable(resolver.resolve(explicit.as_deref()))
                .await
                .map_err(|e| match e {
                    EstError::Transport(msg) => EstError::trust_bootstrap(msg),
                    other => other,
                })
        };

        match result {
            Ok(anchor) => {
                self.transition(SessionState::TrustResolved);
                Ok(&*self.anchor.insert(anchor))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Confirm an implicit anchor by asking `verify` about each certificate.
    ///
    /// Allowed in `TrustResolved` and `CsrReady`. Explicit anchors need no
    /// confirmation and are left unchanged. A rejected certificate fails the
    /// session.
    pub fn confirm_trust_with<F>(&mut self, verify: F) -> Result<()>
    where
        F: Fn(&Certificate, &[u8; 32]) -> bool,
    {
        self.confirm(move |anchor| anchor.confirm_with(verify))
    }

    /// Confirm an implicit anchor against known SHA-256 fingerprints.
    pub fn confirm_fingerprints(&mut self, expected: &[[u8; 32]]) -> Result<()> {
        self.confirm(|anchor| anchor.confirm_fingerprints(expected))
    }

    fn confirm<F>(&mut self, confirm: F) -> Result<()>
    where
        F: FnOnce(TrustAnchor) -> Result<TrustAnchor>,
    {
        self.ensure(
            ops::CONFIRM_TRUST,
            matches!(self.state, SessionState::TrustResolved | SessionState::CsrReady),
        )?;

        let anchor = match self.anchor.take() {
            Some(anchor) => anchor,
            None => return Err(self.invalid(ops::CONFIRM_TRUST)),
        };

        match confirm(anchor) {
            Ok(anchor) => {
                self.anchor = Some(anchor);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Fetch `/csrattrs`. Allowed in `TrustResolved` and `CsrReady`; does not
    /// change state. A server without the endpoint yields an empty set.
    pub async fn request_csr_attrs(&mut self) -> Result<&CsrAttributes> {
        self.ensure(
            ops::REQUEST_CSR_ATTRS,
            matches!(self.state, SessionState::TrustResolved | SessionState::CsrReady),
        )?;

        let result = {
            let anchor = self.trusted_anchor(ops::REQUEST_CSR_ATTRS)?;
            let transport = self.transport.as_ref();
            let trust = ServerTrust::Anchor(anchor);
            self.with_retry(ops::REQUEST_CSR_ATTRS, move || transport.get_csr_attrs(trust))
                .await
        };

        match result {
            Ok(attrs) => {
                tracing::debug!("Server requested {} CSR attribute(s)", attrs.len());
                for attr in &attrs.attributes {
                    tracing::debug!(
                        "  {} ({})",
                        attr.oid,
                        attr.name().unwrap_or("unrecognized")
                    );
                }
                Ok(&*self.csr_attrs.insert(attrs))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Generate a key pair and CSR for `identity`. `TrustResolved -> CsrReady`.
    pub fn build_csr(&mut self, identity: Identity) -> Result<&CertificateRequest> {
        self.ensure(ops::BUILD_CSR, matches!(self.state, SessionState::TrustResolved))?;

        match build_csr_using(self.csr_encoder.as_ref(), &identity, self.config.key_spec) {
            Ok((key, csr)) => {
                self.key = Some(key);
                self.identity = Some(identity);
                self.transition(SessionState::CsrReady);
                Ok(&*self.csr.insert(csr))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Submit the CSR to `/simpleenroll`. `CsrReady -> Enrolled`.
    pub async fn simple_enroll(&mut self) -> Result<&CertificateChain> {
        self.ensure(ops::SIMPLE_ENROLL, matches!(self.state, SessionState::CsrReady))?;
        self.trusted_anchor(ops::SIMPLE_ENROLL)?;

        match self.submit(Submission::Enroll).await {
            Ok(chain) => Ok(self.accept_chain(chain)),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Build the re-enrollment CSR. `Enrolled -> ReenrollReady`.
    ///
    /// The subject and subjectAltName are copied from the issued leaf, which
    /// may differ from the requested identity. Whether the key is kept
    /// follows the configured [`ReenrollKeyPolicy`]. The issued leaf and
    /// its key become the TLS client credential for `/simplereenroll`.
    pub fn prepare_reenroll(&mut self) -> Result<&CertificateRequest> {
        self.ensure(ops::PREPARE_REENROLL, matches!(self.state, SessionState::Enrolled))?;

        match self.reenroll_request() {
            Ok((auth, pending_key, csr)) => {
                self.reenroll_auth = Some(auth);
                self.pending_key = pending_key;
                self.transition(SessionState::ReenrollReady);
                Ok(&*self.csr.insert(csr))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Submit the re-enrollment CSR. `ReenrollReady -> Enrolled`.
    pub async fn simple_reenroll(&mut self) -> Result<&CertificateChain> {
        self.ensure(
            ops::SIMPLE_REENROLL,
            matches!(self.state, SessionState::ReenrollReady),
        )?;
        self.trusted_anchor(ops::SIMPLE_REENROLL)?;

        match self.submit(Submission::Reenroll).await {
            Ok(chain) => {
                if let Some(key) = self.pending_key.take() {
                    self.key = Some(key);
                }
                self.reenroll_auth = None;
                Ok(self.accept_chain(chain))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Hand the issued chain and key to the caller. `Enrolled -> Terminal(Success)`.
    pub fn finish(mut self) -> Result<EnrollmentOutcome> {
        self.ensure(ops::FINISH, matches!(self.state, SessionState::Enrolled))?;

        let (chain, key, trust_anchor) = match (self.chain.take(), self.key.take(), self.anchor.take()) {
            (Some(chain), Some(key), Some(anchor)) => (chain, key, anchor),
            _ => return Err(self.invalid(ops::FINISH)),
        };
        let pem = chain.to_pem()?;

        self.transition(SessionState::Terminal(TerminalState::Success));
        Ok(EnrollmentOutcome {
            chain,
            key,
            pem,
            trust_anchor,
        })
    }

    fn reenroll_request(&self) -> Result<(AuthCredential, Option<KeyPair>, CertificateRequest)> {
        let (key, chain) = match (&self.key, &self.chain) {
            (Some(key), Some(chain)) => (key, chain),
            _ => return Err(self.invalid(ops::PREPARE_REENROLL)),
        };
        let leaf = chain
            .leaf()
            .ok_or_else(|| EstError::csr_build("Issued chain has no leaf certificate"))?;

        let auth = AuthCredential::ClientCert(ClientIdentity::new(
            chain.to_pem()?,
            key.private_key_pem(),
        ));

        match self.config.reenroll_key_policy {
            ReenrollKeyPolicy::Reuse => {
                let csr = self.csr_encoder.encode_renewal(leaf, key)?;
                Ok((auth, None, csr))
            }
            ReenrollKeyPolicy::Regenerate => {
                let new_key = KeyPair::generate(self.config.key_spec)?;
                let csr = self.csr_encoder.encode_renewal(leaf, &new_key)?;
                Ok((auth, Some(new_key), csr))
            }
        }
    }

    async fn submit(&self, submission: Submission) -> Result<CertificateChain> {
        let operation = submission.operation();
        let anchor = self.trusted_anchor(operation)?;
        let csr = self.csr.as_ref().ok_or_else(|| self.invalid(operation))?;

        let transport = self.transport.as_ref();
        let trust = ServerTrust::Anchor(anchor);
        let csr_der = csr.der();

        let der = match submission {
            Submission::Enroll => {
                let auth = self.config.auth.as_ref();
                self.with_retry(operation, move || transport.simple_enroll(trust, csr_der, auth))
                    .await?
            }
            Submission::Reenroll => {
                let auth = self.reenroll_auth.as_ref();
                self.with_retry(operation, move || {
                    transport.simple_reenroll(trust, csr_der, auth)
                })
                .await?
            }
        };

        self.decoder.decode(&der)
    }

    fn accept_chain(&mut self, chain: CertificateChain) -> &CertificateChain {
        if let Some(subject) = self.csr.as_ref().and_then(|csr| csr.subject().ok()) {
            chain.check_subject(&subject);
        }
        if let Some(leaf) = chain.leaf() {
            tracing::info!(
                "Certificate issued: subject '{}', serial {}, {} certificate(s) in chain",
                leaf.tbs_certificate.subject,
                leaf.tbs_certificate.serial_number,
                chain.len()
            );
        }
        self.transition(SessionState::Enrolled);
        &*self.chain.insert(chain)
    }

    /// Run `attempt` until it succeeds, retrying per the retry policy.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.retry;
        let mut transport_retries = 0u32;
        let mut pending_retries = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(EstError::Cancelled);
            }

            let err = match self.cancellable(attempt()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let delay = if matches!(err, EstError::Transport(_))
                && transport_retries < policy.max_retries
            {
                transport_retries += 1;
                let delay = policy.backoff(transport_retries);
                tracing::warn!(
                    "{} failed: {}; retry {}/{} in {:?}",
                    operation,
                    err,
                    transport_retries,
                    policy.max_retries,
                    delay
                );
                delay
            } else if matches!(err, EstError::EnrollmentRejected { .. })
                && err.is_retryable()
                && pending_retries < policy.max_pending_retries
            {
                let delay =
                    Duration::from_secs(err.retry_after().unwrap_or(DEFAULT_RETRY_AFTER_SECS));
                if delay > policy.max_retry_after {
                    tracing::warn!(
                        "{}: server asked to retry after {:?}, longer than the allowed {:?}",
                        operation,
                        delay,
                        policy.max_retry_after
                    );
                    return Err(err);
                }
                pending_retries += 1;
                tracing::info!(
                    "{} pending; retry {}/{} in {:?}",
                    operation,
                    pending_retries,
                    policy.max_pending_retries,
                    delay
                );
                delay
            } else {
                return Err(err);
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(EstError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Race `fut` against cancellation and the configured timeout.
    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EstError::Cancelled),
            result = tokio::time::timeout(timeout, fut) => result.unwrap_or_else(|_| {
                Err(EstError::transport(format!("Operation timed out after {:?}", timeout)))
            }),
        }
    }

    fn trusted_anchor(&self, operation: &'static str) -> Result<&TrustAnchor> {
        match &self.anchor {
            Some(anchor) if anchor.is_trusted() => Ok(anchor),
            Some(_) => Err(EstError::tls_trust(
                "Bootstrap trust anchor has not been confirmed out-of-band",
            )),
            None => Err(self.invalid(operation)),
        }
    }

    fn ensure(&self, operation: &'static str, allowed: bool) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &'static str) -> EstError {
        EstError::invalid_state(operation, self.state.to_string())
    }

    fn transition(&mut self, next: SessionState) {
        tracing::info!("Enrollment session {} -> {}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: EstError) -> EstError {
        tracing::error!("Enrollment failed in state {}: {}", self.state, err);
        self.key = None;
        self.pending_key = None;
        self.reenroll_auth = None;
        self.state = SessionState::Terminal(TerminalState::Failed(SessionFailure {
            kind: err.kind(),
            message: err.to_string(),
        }));
        err
    }
}
