//! In-process HTTPS EST server on rustls.
//!
//! Serves `/cacerts`, `/simpleenroll` and `/simplereenroll` from a
//! [`TestPki`] and records, per request, the client certificate presented
//! during the handshake. Each connection is handled on its own thread.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::*;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};

use crate::integration::{
    TestPki, CONTENT_TYPE_PKCS7, PATH_CACERTS, PATH_SIMPLEENROLL, PATH_SIMPLEREENROLL,
};

/// A request that completed the TLS handshake.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    /// DER of the first client certificate, if one was presented.
    pub client_certificate: Option<Vec<u8>>,
}

pub struct TlsEstServer {
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
}

impl TlsEstServer {
    /// Start a server whose certificate chains to `pki`'s root. Client
    /// certificates are optional and verified against the same root.
    pub fn start(pki: Arc<TestPki>) -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.add(pki.root_der()).expect("client root");
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .allow_unauthenticated()
            .build()
            .expect("client verifier");

        let (chain, key) = pki.server_identity();
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .expect("server config");
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let recorder = seen.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let config = config.clone();
                let pki = pki.clone();
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    // Handshake failures are expected in trust tests.
                    let _ = serve(stream, config, &pki, &recorder);
                });
            }
        });

        Self { addr, seen }
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}", self.addr.port())
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// Requests received so far on `request_path`.
    pub fn requests_to(&self, request_path: &str) -> Vec<SeenRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == request_path)
            .collect()
    }
}

fn serve(
    mut tcp: TcpStream,
    config: Arc<ServerConfig>,
    pki: &TestPki,
    seen: &Mutex<Vec<SeenRequest>>,
) -> io::Result<()> {
    tcp.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut conn =
        ServerConnection::new(config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let (request_line, body) = read_request(&mut rustls::Stream::new(&mut conn, &mut tcp))?;
    let client_certificate = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.to_vec());

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    seen.lock().unwrap().push(SeenRequest {
        method: method.clone(),
        path: path.clone(),
        client_certificate,
    });

    let (status, body) = route(&method, &path, &body, pki);
    let content_type = if status.starts_with("200") {
        CONTENT_TYPE_PKCS7
    } else {
        "text/plain"
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Transfer-Encoding: base64\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );

    let mut tls = rustls::Stream::new(&mut conn, &mut tcp);
    tls.write_all(response.as_bytes())?;
    tls.flush()?;
    conn.send_close_notify();
    conn.complete_io(&mut tcp)?;
    Ok(())
}

fn route(method: &str, path: &str, body: &[u8], pki: &TestPki) -> (&'static str, String) {
    match (method, path) {
        ("GET", PATH_CACERTS) => ("200 OK", pki.cacerts_base64()),
        ("POST", PATH_SIMPLEENROLL) | ("POST", PATH_SIMPLEREENROLL) => {
            let cleaned: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            match BASE64_STANDARD.decode(cleaned) {
                Ok(csr_der) => ("200 OK", pki.enroll_response(&csr_der)),
                Err(_) => ("400 Bad Request", "CSR is not base64".to_string()),
            }
        }
        _ => ("404 Not Found", String::new()),
    }
}

/// Read one HTTP/1.1 request: the request line and a Content-Length body.
fn read_request(stream: &mut impl Read) -> io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let request_line = head.lines().next().unwrap_or_default().to_string();
    let body_end = buf.len().min(body_start + content_length);
    Ok((request_line, buf[body_start..body_end].to_vec()))
}
