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

//! Error types for the EST enrollment core.
//!
//! Every failure surfaced by the crate is an [`EstError`]. The variants follow
//! the protocol phases: bootstrap trust, CSR construction, transport, server
//! rejection, TLS trust, and PKCS#7 decoding. The enrollment session uses
//! [`EstError::is_retryable`] to decide between retrying a transition and
//! terminating.

use std::fmt;

use thiserror::Error;

/// Result type alias using [`EstError`].
pub type Result<T> = std::result::Result<T, EstError>;

/// Errors that can occur during EST enrollment.
#[derive(Debug, Error)]
pub enum EstError {
    /// The initial trust anchor could not be established.
    #[error("Trust bootstrap failed: {0}")]
    TrustBootstrap(String),

    /// Key generation or CSR construction failed.
    #[error("CSR build error: {0}")]
    CsrBuild(String),

    /// Network-level failure (connect, timeout, truncated body).
    ///
    /// Transport errors are retryable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The EST server answered with a non-success status, or with
    /// HTTP 202 asking the client to come back later.
    #[error("Enrollment rejected with status {status}: {message}")]
    EnrollmentRejected {
        /// HTTP status code.
        status: u16,
        /// Message from the response body or challenge header.
        message: String,
        /// Server-suggested delay in seconds, if any.
        retry_after: Option<u64>,
    },

    /// The server certificate did not verify against the resolved trust
    /// anchor, or the anchor has not been confirmed yet. Never retried.
    #[error("TLS trust error: {0}")]
    TlsTrust(String),

    /// The response was not a usable PKCS#7 certs-only structure.
    #[error("PKCS#7 decode error: {0}")]
    Pkcs7Decode(String),

    /// The `/csrattrs` response could not be decoded.
    #[error("CSR attributes decode error: {0}")]
    CsrAttrsDecode(String),

    /// An operation was invoked in a state that does not allow it.
    #[error("Operation '{operation}' not allowed in state {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// Name of the session state at the time of the call.
        state: String,
    },

    /// The caller cancelled the session.
    #[error("Enrollment cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid PEM data.
    #[error("Invalid PEM data: {0}")]
    InvalidPem(String),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`EstError`], recorded on terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`EstError::TrustBootstrap`].
    TrustBootstrap,
    /// See [`EstError::CsrBuild`].
    CsrBuild,
    /// See [`EstError::Transport`].
    Transport,
    /// See [`EstError::EnrollmentRejected`].
    EnrollmentRejected,
    /// See [`EstError::TlsTrust`].
    TlsTrust,
    /// See [`EstError::Pkcs7Decode`].
    Pkcs7Decode,
    /// See [`EstError::CsrAttrsDecode`].
    CsrAttrsDecode,
    /// See [`EstError::InvalidState`].
    InvalidState,
    /// See [`EstError::Cancelled`].
    Cancelled,
    /// Configuration, PEM, URL and I/O problems.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TrustBootstrap => "TrustBootstrapError",
            Self::CsrBuild => "CsrBuildError",
            Self::Transport => "TransportError",
            Self::EnrollmentRejected => "EnrollmentRejected",
            Self::TlsTrust => "TlsTrustError",
            Self::Pkcs7Decode => "Pkcs7DecodeError",
            Self::CsrAttrsDecode => "CsrAttrsDecodeError",
            Self::InvalidState => "InvalidState",
            Self::Cancelled => "Cancelled",
            Self::Config => "ConfigError",
        };
        f.write_str(name)
    }
}

impl EstError {
    /// Create a trust bootstrap error with the given message.
    pub fn trust_bootstrap(msg: impl Into<String>) -> Self {
        Self::TrustBootstrap(msg.into())
    }

    /// Create a CSR build error with the given message.
    pub fn csr_build(msg: impl Into<String>) -> Self {
        Self::CsrBuild(msg.into())
    }

    /// Create a transport error with the given message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an enrollment rejection.
    pub fn rejected(status: u16, message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self::EnrollmentRejected {
            status,
            message: message.into(),
            retry_after,
        }
    }

    /// Create a TLS trust error with the given message.
    pub fn tls_trust(msg: impl Into<String>) -> Self {
        Self::TlsTrust(msg.into())
    }

    /// Create a PKCS#7 decode error with the given message.
    pub fn pkcs7_decode(msg: impl Into<String>) -> Self {
        Self::Pkcs7Decode(msg.into())
    }

    /// Create a CSR attributes decode error with the given message.
    pub fn csr_attrs_decode(msg: impl Into<String>) -> Self {
        Self::CsrAttrsDecode(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(operation: &'static str, state: impl Into<String>) -> Self {
        Self::InvalidState {
            operation,
            state: state.into(),
        }
    }

    /// Create a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid PEM error with the given message.
    pub fn invalid_pem(msg: impl Into<String>) -> Self {
        Self::InvalidPem(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TrustBootstrap(_) => ErrorKind::TrustBootstrap,
            Self::CsrBuild(_) => ErrorKind::CsrBuild,
            Self::Transport(_) => ErrorKind::Transport,
            Self::EnrollmentRejected { .. } => ErrorKind::EnrollmentRejected,
            Self::TlsTrust(_) => ErrorKind::TlsTrust,
            Self::Pkcs7Decode(_) => ErrorKind::Pkcs7Decode,
            Self::CsrAttrsDecode(_) => ErrorKind::CsrAttrsDecode,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) | Self::InvalidPem(_) | Self::Url(_) | Self::Io(_) => ErrorKind::Config,
        }
    }

    /// Returns true if the failed transition may be attempted again.
    ///
    /// Transport failures are always retryable. A rejection is retryable only
    /// when the server asked to come back later (202, or 503 with a
    /// Retry-After header).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::EnrollmentRejected {
                status,
                retry_after,
                ..
            } => *status == 202 || (*status == 503 && retry_after.is_some()),
            _ => false,
        }
    }

    /// Returns the server-suggested retry delay in seconds, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::EnrollmentRejected { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
