//! TLS configuration helpers for the EST client.
//!
//! Every EST operation runs over its own HTTPS client built here. The client
//! trusts exactly the certificates of the resolved [`TrustAnchor`] (no
//! built-in roots), or nothing at all during implicit bootstrap.

use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::ClientIdentity;
use crate::error::{EstError, Result};
use crate::trust::TrustAnchor;

/// How the server certificate is verified for one request.
#[derive(Debug, Clone, Copy)]
pub enum ServerTrust<'a> {
    /// Verify against the anchor certificates only.
    Anchor(&'a TrustAnchor),

    /// Accept any server certificate. Only used to fetch `/cacerts` during
    /// implicit bootstrap.
    Unverified,
}

/// Settings shared by every client a connector builds.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Overall request timeout.
    pub timeout: Duration,

    /// Headers added to every request.
    pub additional_headers: Vec<(String, String)>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: crate::config::DEFAULT_TIMEOUT,
            additional_headers: Vec::new(),
        }
    }
}

/// Builds the HTTPS client used for a single EST operation.
pub trait TlsConnector: Send + Sync {
    /// Build a client for `trust`, optionally presenting `identity`.
    fn connect(
        &self,
        trust: ServerTrust<'_>,
        identity: Option<&ClientIdentity>,
        options: &ConnectOptions,
    ) -> Result<reqwest::Client>;
}

/// [`TlsConnector`] using reqwest over rustls.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustlsConnector;

impl TlsConnector for RustlsConnector {
    fn connect(
        &self,
        trust: ServerTrust<'_>,
        identity: Option<&ClientIdentity>,
        options: &ConnectOptions,
    ) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(options.timeout)
            .connect_timeout(options.timeout)
            .pool_max_idle_per_host(0)
            .user_agent(crate::USER_AGENT)
            .tls_built_in_root_certs(false)
            // RFC 7030 Section 3.3.1 requires TLS 1.1 or later; 1.1 is deprecated.
            .min_tls_version(reqwest::tls::Version::TLS_1_2);

        match trust {
            ServerTrust::Anchor(anchor) => {
                if !anchor.is_trusted() {
                    return Err(EstError::tls_trust(
                        "Trust anchor was bootstrapped implicitly and has not been confirmed",
                    ));
                }
                for der in anchor.to_der_vec()? {
                    let cert = reqwest::Certificate::from_der(&der).map_err(|e| {
                        EstError::tls_trust(format!("Failed to load anchor certificate: {}", e))
                    })?;
                    builder = builder.add_root_certificate(cert);
                }
            }
            ServerTrust::Unverified => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        if let Some(identity) = identity {
            builder = builder.identity(build_reqwest_identity(identity)?);
        }

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &options.additional_headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::try_from(name.as_str()),
                reqwest::header::HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, value);
            } else {
                tracing::warn!("Ignoring invalid header '{}'", name);
            }
        }
        builder = builder.default_headers(headers);

        builder
            .build()
            .map_err(|e| EstError::transport(format!("Failed to build HTTP client: {}", e)))
    }
}

/// Build a reqwest Identity from PEM-encoded certificate and key.
fn build_reqwest_identity(identity: &ClientIdentity) -> Result<reqwest::Identity> {
    // Combine cert and key into a single PEM buffer for reqwest
    let mut pem_data = identity.cert_pem.clone();
    pem_data.extend_from_slice(b"\n");
    pem_data.extend_from_slice(&identity.key_pem);

    reqwest::Identity::from_pem(&pem_data)
        .map_err(|e| EstError::invalid_pem(format!("Failed to create client identity: {}", e)))
}

/// Map a reqwest failure to the crate taxonomy.
///
/// Certificate verification failures become [`EstError::TlsTrust`]; anything
/// else is a retryable [`EstError::Transport`].
pub(crate) fn classify_reqwest_error(err: reqwest::Error) -> EstError {
    if is_certificate_error(&err) {
        return EstError::tls_trust(format!("Server certificate rejected: {}", error_chain(&err)));
    }

    if err.is_timeout() {
        EstError::transport(format!("Request timed out: {}", error_chain(&err)))
    } else {
        EstError::transport(error_chain(&err))
    }
}

/// Returns true if a rustls certificate error appears anywhere in the chain.
pub(crate) fn is_certificate_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return is_trust_failure(tls);
        }
        if let Some(inner) = e
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::get_ref)
        {
            let inner: &(dyn std::error::Error + 'static) = inner;
            if is_certificate_error(inner) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

fn is_trust_failure(err: &rustls::Error) -> bool {
    use rustls::AlertDescription;

    match err {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => true,
        rustls::Error::AlertReceived(alert) => matches!(
            alert,
            AlertDescription::BadCertificate
                | AlertDescription::UnknownCA
                | AlertDescription::CertificateUnknown
                | AlertDescription::CertificateRequired
        ),
        _ => false,
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(e) = source {
        message.push_str(": ");
        message.push_str(&e.to_string());
        source = e.source();
    }
    message
}

/// Parse PEM-encoded certificates.
pub fn parse_pem_certificates(pem_data: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem_data);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| result.ok())
        .collect();

    if certs.is_empty() {
        return Err(EstError::invalid_pem("No certificates found in PEM data"));
    }

    Ok(certs)
}

/// Parse a PEM-encoded private key.
pub fn parse_pem_private_key(pem_data: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem_data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(EstError::invalid_pem(format!("Failed to parse PEM: {}", e)));
            }
        }
    }

    Err(EstError::invalid_pem("No private key found in PEM data"))
}
