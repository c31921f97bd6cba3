//! EST transport layer.
//!
//! [`EstTransport`] is the network seam of the enrollment session: one async
//! method per RFC 7030 endpoint. [`HttpTransport`] implements it with
//! reqwest, building a fresh TLS client for every call so that each
//! operation negotiates its own connection against the session's trust
//! anchor.

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER, WWW_AUTHENTICATE};
use reqwest::StatusCode;

use crate::config::{AuthCredential, ClientIdentity, Endpoint, EstClientConfig};
use crate::error::{EstError, Result};
use crate::tls::{classify_reqwest_error, ConnectOptions, RustlsConnector, ServerTrust, TlsConnector};
use crate::types::pkcs7::decode_base64;
use crate::types::{content_types, operations, CsrAttributes};

/// Delay assumed when a 202 response carries no usable Retry-After.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const MAX_ERROR_BODY: usize = 512;

/// The four EST operations used during enrollment.
///
/// Implementations must be safe to share between sessions.
#[async_trait]
pub trait EstTransport: Send + Sync {
    /// `GET /cacerts`. Returns the PKCS#7 DER after transfer decoding.
    async fn get_ca_certs(&self, trust: ServerTrust<'_>) -> Result<Vec<u8>>;

    /// `GET /csrattrs`. A 404 yields an empty set.
    async fn get_csr_attrs(&self, trust: ServerTrust<'_>) -> Result<CsrAttributes>;

    /// `POST /simpleenroll`. Returns the PKCS#7 DER of the issued chain.
    async fn simple_enroll(
        &self,
        trust: ServerTrust<'_>,
        csr_der: &[u8],
        auth: Option<&AuthCredential>,
    ) -> Result<Vec<u8>>;

    /// `POST /simplereenroll`. Returns the PKCS#7 DER of the issued chain.
    async fn simple_reenroll(
        &self,
        trust: ServerTrust<'_>,
        csr_der: &[u8],
        auth: Option<&AuthCredential>,
    ) -> Result<Vec<u8>>;
}

/// [`EstTransport`] over HTTPS.
pub struct HttpTransport {
    endpoint: Endpoint,
    connector: Arc<dyn TlsConnector>,
    options: ConnectOptions,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create a transport for `endpoint` using `connector`.
    pub fn new(endpoint: Endpoint, connector: Arc<dyn TlsConnector>, options: ConnectOptions) -> Self {
        Self {
            endpoint,
            connector,
            options,
        }
    }

    /// Create a rustls-backed transport from a session configuration.
    pub fn from_config(config: &EstClientConfig) -> Self {
        Self::new(
            config.endpoint(),
            Arc::new(RustlsConnector),
            ConnectOptions {
                timeout: config.timeout,
                additional_headers: config.additional_headers.clone(),
            },
        )
    }

    /// The endpoint this transport talks to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn client(
        &self,
        trust: ServerTrust<'_>,
        identity: Option<&ClientIdentity>,
    ) -> Result<reqwest::Client> {
        self.connector.connect(trust, identity, &self.options)
    }

    async fn enroll_request(
        &self,
        operation: &str,
        trust: ServerTrust<'_>,
        csr_der: &[u8],
        auth: Option<&AuthCredential>,
    ) -> Result<Vec<u8>> {
        let url = self.endpoint.url(operation);
        tracing::debug!("POST {}", url);

        let identity = match auth {
            Some(AuthCredential::ClientCert(identity)) => Some(identity),
            _ => None,
        };
        let client = self.client(trust, identity)?;

        let body = BASE64_STANDARD.encode(csr_der);
        let mut request = client
            .post(url)
            .header(CONTENT_TYPE, content_types::PKCS10)
            .header("Content-Transfer-Encoding", "base64")
            .body(body);

        if let Some(AuthCredential::Basic(auth)) = auth {
            let credentials =
                BASE64_STANDARD.encode(format!("{}:{}", auth.username, auth.password));
            request = request.header(AUTHORIZATION, format!("Basic {}", credentials));
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;

        // HTTP 202: the request was accepted but the certificate is not ready.
        if response.status() == StatusCode::ACCEPTED {
            let retry_after =
                extract_retry_after(response.headers()).unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            tracing::info!("{} pending, server asks to retry after {}s", operation, retry_after);
            return Err(EstError::rejected(
                StatusCode::ACCEPTED.as_u16(),
                "Enrollment pending",
                Some(retry_after),
            ));
        }

        let response = handle_error_response(response).await?;
        read_pkcs7_body(response).await
    }
}

#[async_trait]
impl EstTransport for HttpTransport {
    async fn get_ca_certs(&self, trust: ServerTrust<'_>) -> Result<Vec<u8>> {
        let url = self.endpoint.url(operations::CACERTS);
        tracing::debug!("GET {}", url);

        let client = self.client(trust, None)?;
        let response = client.get(url).send().await.map_err(classify_reqwest_error)?;
        let response = handle_error_response(response).await?;

        read_pkcs7_body(response).await
    }

    async fn get_csr_attrs(&self, trust: ServerTrust<'_>) -> Result<CsrAttributes> {
        let url = self.endpoint.url(operations::CSR_ATTRS);
        tracing::debug!("GET {}", url);

        let client = self.client(trust, None)?;
        let response = client.get(url).send().await.map_err(classify_reqwest_error)?;

        // The endpoint is optional; 404 means the server has no requirements.
        if response.status() == StatusCode::NOT_FOUND || response.status() == StatusCode::NO_CONTENT
        {
            tracing::debug!("Server has no CSR attributes ({})", response.status());
            return Ok(CsrAttributes::new());
        }

        let response = handle_error_response(response).await?;
        let body = response.bytes().await.map_err(classify_reqwest_error)?;
        CsrAttributes::parse(&body)
    }

    async fn simple_enroll(
        &self,
        trust: ServerTrust<'_>,
        csr_der: &[u8],
        auth: Option<&AuthCredential>,
    ) -> Result<Vec<u8>> {
        self.enroll_request(operations::SIMPLE_ENROLL, trust, csr_der, auth)
            .await
    }

    async fn simple_reenroll(
        &self,
        trust: ServerTrust<'_>,
        csr_der: &[u8],
        auth: Option<&AuthCredential>,
    ) -> Result<Vec<u8>> {
        self.enroll_request(operations::SIMPLE_REENROLL, trust, csr_der, auth)
            .await
    }
}

/// Read a certs-only body, honoring `Content-Transfer-Encoding: binary`.
async fn read_pkcs7_body(response: reqwest::Response) -> Result<Vec<u8>> {
    let binary = response
        .headers()
        .get("content-transfer-encoding")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("binary"));

    let body = response.bytes().await.map_err(classify_reqwest_error)?;
    if binary {
        Ok(body.to_vec())
    } else {
        decode_base64(&body)
    }
}

/// Handle error responses from the server.
async fn handle_error_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        return Err(EstError::rejected(
            status.as_u16(),
            format!("Authentication required: {}", challenge),
            None,
        ));
    }

    let retry_after = extract_retry_after(response.headers());
    let mut message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    if message.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    let message = match message.trim() {
        "" => status.canonical_reason().unwrap_or("Server error").to_string(),
        trimmed => trimmed.to_string(),
    };

    Err(EstError::rejected(status.as_u16(), message, retry_after))
}

/// Extract the Retry-After header value in seconds.
fn extract_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| parse_retry_after(s, Utc::now()))
}

/// Parse a Retry-After value: delta-seconds or an HTTP-date.
///
/// Dates in the past yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs);
    }

    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc).signed_duration_since(now);
    Some(u64::try_from(delta.num_seconds()).unwrap_or(0))
}
