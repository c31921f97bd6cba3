// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! File-based session settings.
//!
//! [`EstSettings`] is the TOML form of an [`EstClientConfig`] plus the
//! identity to enroll:
//!
//! ```toml
//! [server]
//! url = "https://est.example.com:8443"
//! ca_label = "devices"
//! timeout_seconds = 30
//!
//! [trust]
//! mode = "implicit"
//! fingerprints = ["3a:5f:...:9c"]
//!
//! [auth]
//! method = "http_basic"
//! username = "device001"
//! password_source = "env:EST_PASSWORD"
//!
//! [identity]
//! common_name = "device001.example.com"
//! organization = "Example Corp"
//! country = "US"
//!
//! [enrollment]
//! key = "ecdsa-p384"
//! reenroll_key = "regenerate"
//! max_retries = 5
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ClientIdentity, EstClientConfig, ReenrollKeyPolicy, RetryPolicy};
use crate::csr::{Identity, KeySpec};
use crate::error::{EstError, Result};
use crate::trust::parse_fingerprint;

/// Complete settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EstSettings {
    /// EST server location.
    pub server: ServerSettings,

    /// Trust anchor source.
    #[serde(default)]
    pub trust: TrustSettings,

    /// Credential presented on enrollment.
    #[serde(default)]
    pub auth: AuthSettings,

    /// Subject of the requested certificate.
    #[serde(default)]
    pub identity: Option<Identity>,

    /// Key and retry behaviour.
    #[serde(default)]
    pub enrollment: EnrollmentSettings,
}

/// `[server]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// Base URL of the EST server.
    pub url: String,

    /// Optional CA label.
    #[serde(default)]
    pub ca_label: Option<String>,

    /// Per-operation timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Permit `http://` URLs.
    #[serde(default)]
    pub allow_insecure_http: bool,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_timeout_seconds() -> u64 {
    30
}

/// How the trust anchor is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Load a CA bundle from `ca_bundle_path`.
    Explicit,
    /// Fetch `/cacerts` and confirm it against `fingerprints`.
    #[default]
    Implicit,
}

/// `[trust]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustSettings {
    /// Trust mode.
    #[serde(default)]
    pub mode: TrustMode,

    /// PEM or DER CA bundle for explicit mode.
    #[serde(default)]
    pub ca_bundle_path: Option<PathBuf>,

    /// Expected SHA-256 fingerprints for implicit mode.
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

/// Enrollment authentication method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// No credential.
    #[default]
    None,
    /// HTTP Basic.
    HttpBasic,
    /// TLS client certificate.
    ClientCert,
}

/// `[auth]` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSettings {
    /// Authentication method.
    #[serde(default)]
    pub method: AuthMethod,

    /// Basic auth username.
    #[serde(default)]
    pub username: Option<String>,

    /// Where the password comes from: `env:VAR` or `file:/path`.
    #[serde(default)]
    pub password_source: Option<String>,

    /// Client certificate PEM.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Client private key PEM.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

/// `[enrollment]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrollmentSettings {
    /// Key algorithm, e.g. `ecdsa-p256` or `rsa-3072`.
    #[serde(default = "default_key")]
    pub key: String,

    /// Re-enrollment key policy.
    #[serde(default)]
    pub reenroll_key: ReenrollKeyPolicy,

    /// Transport retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay.
    #[serde(default = "default_initial_backoff_seconds")]
    pub initial_backoff_seconds: u64,

    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,

    /// Retries after HTTP 202.
    #[serde(default = "default_max_pending_retries")]
    pub max_pending_retries: u32,

    /// Longest Retry-After honoured.
    #[serde(default = "default_max_retry_after_seconds")]
    pub max_retry_after_seconds: u64,
}

fn default_key() -> String {
    KeySpec::default().to_string()
}

fn default_max_retries() -> u32 {
    RetryPolicy::default().max_retries
}

fn default_initial_backoff_seconds() -> u64 {
    RetryPolicy::default().initial_backoff.as_secs()
}

fn default_max_backoff_seconds() -> u64 {
    RetryPolicy::default().max_backoff.as_secs()
}

fn default_max_pending_retries() -> u32 {
    RetryPolicy::default().max_pending_retries
}

fn default_max_retry_after_seconds() -> u64 {
    RetryPolicy::default().max_retry_after.as_secs()
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            key: default_key(),
            reenroll_key: ReenrollKeyPolicy::default(),
            max_retries: default_max_retries(),
            initial_backoff_seconds: default_initial_backoff_seconds(),
            max_backoff_seconds: default_max_backoff_seconds(),
            max_pending_retries: default_max_pending_retries(),
            max_retry_after_seconds: default_max_retry_after_seconds(),
        }
    }
}

impl EnrollmentSettings {
    /// The parsed key specification.
    pub fn key_spec(&self) -> Result<KeySpec> {
        self.key.parse()
    }

    /// The retry policy described by this table.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_secs(self.initial_backoff_seconds),
            max_backoff: Duration::from_secs(self.max_backoff_seconds),
            max_pending_retries: self.max_pending_retries,
            max_retry_after: Duration::from_secs(self.max_retry_after_seconds),
        }
    }
}

impl EstSettings {
    /// Parse settings from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| EstError::config(format!("Invalid TOML: {e}")))
    }

    /// Read and parse a settings file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EstError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        tracing::debug!("Loaded settings from {}", path.display());
        Self::from_toml(&content)
    }

    /// Serialize settings to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EstError::config(format!("TOML serialize: {e}")))
    }

    /// The identity to enroll, if the file names one.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Parsed `[trust] fingerprints`.
    pub fn fingerprints(&self) -> Result<Vec<[u8; 32]>> {
        self.trust
            .fingerprints
            .iter()
            .map(|fp| parse_fingerprint(fp))
            .collect()
    }

    /// Check the settings for missing or inconsistent values.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.server.url.trim().is_empty() {
            errors.push("server.url is required".to_string());
        }

        match self.trust.mode {
            TrustMode::Explicit => {
                if self.trust.ca_bundle_path.is_none() {
                    errors.push(
                        "trust.ca_bundle_path is required when trust.mode is 'explicit'"
                            .to_string(),
                    );
                }
            }
            TrustMode::Implicit => {
                if let Err(e) = self.fingerprints() {
                    errors.push(format!("trust.fingerprints: {e}"));
                }
            }
        }

        match self.auth.method {
            AuthMethod::HttpBasic => {
                if self.auth.username.is_none() {
                    errors.push("auth.username is required for http_basic".to_string());
                }
                if self.auth.password_source.is_none() {
                    errors.push("auth.password_source is required for http_basic".to_string());
                }
            }
            AuthMethod::ClientCert => {
                if self.auth.cert_path.is_none() || self.auth.key_path.is_none() {
                    errors.push("auth.cert_path and auth.key_path are required".to_string());
                }
            }
            AuthMethod::None => {}
        }

        if let Err(e) = self.enrollment.key_spec() {
            errors.push(format!("enrollment.key: {e}"));
        }

        if let Some(identity) = &self.identity {
            if let Err(e) = identity.validate() {
                errors.push(format!("identity: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EstError::config(format!(
                "Settings validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Build a session configuration, reading any referenced files.
    pub fn into_config(&self) -> Result<EstClientConfig> {
        self.validate()?;

        let mut builder = EstClientConfig::builder()
            .server_url(&self.server.url)?
            .timeout(Duration::from_secs(self.server.timeout_seconds))
            .retry_policy(self.enrollment.retry_policy())
            .key_spec(self.enrollment.key_spec()?)
            .reenroll_key_policy(self.enrollment.reenroll_key);

        if let Some(label) = &self.server.ca_label {
            builder = builder.ca_label(label);
        }
        for (name, value) in &self.server.headers {
            builder = builder.add_header(name, value);
        }
        if self.server.allow_insecure_http {
            builder = builder.allow_insecure_http();
        }

        builder = match (self.trust.mode, &self.trust.ca_bundle_path) {
            (TrustMode::Explicit, Some(path)) => builder.trust_explicit(read_file(path)?),
            _ => builder.trust_implicit(),
        };

        match self.auth.method {
            AuthMethod::HttpBasic => {
                if let Some(username) = &self.auth.username {
                    builder = builder.http_auth(username, self.resolve_password()?);
                }
            }
            AuthMethod::ClientCert => {
                if let (Some(cert), Some(key)) = (&self.auth.cert_path, &self.auth.key_path) {
                    builder = builder.client_identity(ClientIdentity::new(
                        read_file(cert)?,
                        read_file(key)?,
                    ));
                }
            }
            AuthMethod::None => {}
        }

        builder.build()
    }

    fn resolve_password(&self) -> Result<String> {
        let source = self
            .auth
            .password_source
            .as_deref()
            .ok_or_else(|| EstError::config("auth.password_source not configured"))?;

        if let Some(var) = source.strip_prefix("env:") {
            std::env::var(var)
                .map_err(|_| EstError::config(format!("Environment variable {var} not set")))
        } else if let Some(path) = source.strip_prefix("file:") {
            let content = std::fs::read_to_string(path)
                .map_err(|e| EstError::config(format!("Failed to read {path}: {e}")))?;
            Ok(content.trim_end_matches(['\r', '\n']).to_string())
        } else {
            Err(EstError::config(format!(
                "Unsupported password_source '{source}'; use env:VAR or file:PATH"
            )))
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| EstError::config(format!("Failed to read {}: {e}", path.display())))
}
