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

//! EST Enrollment Command-Line Tool
//!
//! Runs one enrollment session against an EST server (RFC 7030).
//!
//! # Usage
//!
//! ```text
//! est-enroll [OPTIONS] <COMMAND>
//!
//! Commands:
//!   enroll    Enroll for a certificate and write the chain and key
//!   ca-info   Fetch and display the CA certificates with fingerprints
//!   test-csr  Generate and display a CSR without enrolling
//!
//! Options:
//!   -c, --config <PATH>     Path to a TOML settings file
//!   -s, --server <URL>      EST server URL (overrides the settings file)
//!       --ca-label <LABEL>  CA label
//!   -v, --verbose           Enable verbose output
//!   -q, --quiet             Suppress non-error output
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Discover the CA fingerprints
//! est-enroll ca-info --server https://est.example.com
//!
//! # Enroll, confirming the bootstrap CA by fingerprint
//! EST_PASSWORD=secret est-enroll enroll --server https://est.example.com \
//!     --username device001 --fingerprint 3a:5f:...:9c \
//!     --cn device001.example.com --output device001.pem
//!
//! # Enroll with an explicit anchor, then renew immediately
//! est-enroll enroll --server https://est.example.com --ca-cert ca.pem \
//!     --username device001 --cn device001.example.com --reenroll
//! ```

use std::error::Error;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use est_enroll_core::config::{AuthCredential, HttpAuth};
use est_enroll_core::csr::{build_csr, Identity, KeySpec};
use est_enroll_core::tls::ServerTrust;
use est_enroll_core::transport::{EstTransport, HttpTransport};
use est_enroll_core::trust::{compute_fingerprint, format_fingerprint, parse_fingerprint, resolve_trust};
use est_enroll_core::{
    decode_pkcs7, CertificateChain, ClientIdentity, EnrollmentSession, EstClientConfig,
    EstSettings, ReenrollKeyPolicy, TrustAnchor, TrustSource,
};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// EST Enrollment Command-Line Tool
#[derive(Parser)]
#[command(name = "est-enroll")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Certificate enrollment using EST (RFC 7030)", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a TOML settings file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// EST server URL
    #[arg(short, long, global = true, value_name = "URL", env = "EST_SERVER")]
    server: Option<String>,

    /// CA label for multi-CA servers
    #[arg(long, global = true, value_name = "LABEL")]
    ca_label: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll for a certificate and write the chain and key
    Enroll {
        #[command(flatten)]
        trust: TrustArgs,

        #[command(flatten)]
        auth: AuthArgs,

        #[command(flatten)]
        subject: SubjectArgs,

        /// Output path for the PEM certificate chain
        #[arg(short, long, value_name = "PATH", default_value = "est-cert.pem")]
        output: PathBuf,

        /// Output path for the PKCS#8 private key (default: output with .key)
        #[arg(long, value_name = "PATH")]
        key_output: Option<PathBuf>,

        /// Fetch /csrattrs before building the CSR
        #[arg(long)]
        csr_attrs: bool,

        /// Immediately re-enroll using the issued certificate
        #[arg(long)]
        reenroll: bool,

        /// Generate a new key pair when re-enrolling
        #[arg(long, requires = "reenroll")]
        new_key: bool,
    },

    /// Fetch and display the CA certificates with fingerprints
    CaInfo {
        #[command(flatten)]
        trust: TrustArgs,

        /// Print the certificates as PEM
        #[arg(long)]
        pem: bool,
    },

    /// Generate and display a CSR without enrolling
    TestCsr {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Write the private key here
        #[arg(long, value_name = "PATH")]
        key_output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct TrustArgs {
    /// PEM or DER CA bundle to trust explicitly
    #[arg(long, value_name = "PATH")]
    ca_cert: Option<PathBuf>,

    /// Expected SHA-256 fingerprint of a bootstrap CA certificate
    #[arg(long = "fingerprint", value_name = "HEX", conflicts_with = "ca_cert")]
    fingerprints: Vec<String>,

    /// Accept bootstrap CA certificates without fingerprint confirmation
    #[arg(long, conflicts_with = "ca_cert")]
    trust_on_first_use: bool,

    /// Allow plain http:// server URLs (test servers only)
    #[arg(long)]
    insecure_http: bool,
}

#[derive(Args)]
struct AuthArgs {
    /// HTTP Basic username
    #[arg(short, long, env = "EST_USERNAME")]
    username: Option<String>,

    /// HTTP Basic password
    #[arg(long, env = "EST_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Client certificate PEM for TLS authentication
    #[arg(long, value_name = "PATH", requires = "client_key")]
    client_cert: Option<PathBuf>,

    /// Client private key PEM for TLS authentication
    #[arg(long, value_name = "PATH", requires = "client_cert")]
    client_key: Option<PathBuf>,
}

#[derive(Args)]
struct SubjectArgs {
    /// Subject Common Name
    #[arg(long = "cn", value_name = "CN")]
    common_name: Option<String>,

    /// Two-letter country code
    #[arg(long)]
    country: Option<String>,

    /// State or province
    #[arg(long)]
    state: Option<String>,

    /// Locality
    #[arg(long)]
    city: Option<String>,

    /// Organization
    #[arg(long)]
    organization: Option<String>,

    /// Organizational unit
    #[arg(long)]
    organizational_unit: Option<String>,

    /// Email address
    #[arg(long)]
    email: Option<String>,

    /// Key algorithm (ecdsa-p256, ecdsa-p384, ed25519, rsa-2048, rsa-3072, rsa-4096)
    #[arg(long, value_name = "ALG")]
    key: Option<KeySpec>,
}

impl SubjectArgs {
    /// Merge command-line subject fields over `base`.
    fn identity(&self, base: Option<&Identity>) -> CliResult<Identity> {
        let mut identity = match (base, &self.common_name) {
            (_, Some(cn)) => Identity {
                common_name: cn.clone(),
                ..base.cloned().unwrap_or_default()
            },
            (Some(base), None) => base.clone(),
            (None, None) => return Err("a subject common name is required (--cn)".into()),
        };

        let overrides = [
            (&mut identity.country, &self.country),
            (&mut identity.state, &self.state),
            (&mut identity.city, &self.city),
            (&mut identity.organization, &self.organization),
            (&mut identity.organizational_unit, &self.organizational_unit),
            (&mut identity.email_address, &self.email),
        ];
        for (field, value) in overrides {
            if value.is_some() {
                field.clone_from(value);
            }
        }

        identity.validate()?;
        Ok(identity)
    }
}

/// Session configuration assembled from the settings file and flags.
struct Loaded {
    config: EstClientConfig,
    fingerprints: Vec<[u8; 32]>,
    identity: Option<Identity>,
}

fn load(cli: &Cli, trust: &TrustArgs, auth: Option<&AuthArgs>) -> CliResult<Loaded> {
    let (mut config, mut fingerprints, identity) = match &cli.config {
        Some(path) => {
            let mut settings = EstSettings::from_file(path)?;
            if let Some(server) = &cli.server {
                settings.server.url = server.clone();
            }
            if let Some(label) = &cli.ca_label {
                settings.server.ca_label = Some(label.clone());
            }
            if trust.insecure_http {
                settings.server.allow_insecure_http = true;
            }
            (
                settings.into_config()?,
                settings.fingerprints()?,
                settings.identity().cloned(),
            )
        }
        None => {
            let server = cli
                .server
                .as_deref()
                .ok_or("an EST server URL is required (--server or --config)")?;
            let mut builder = EstClientConfig::builder().server_url(server)?;
            if let Some(label) = &cli.ca_label {
                builder = builder.ca_label(label);
            }
            if trust.insecure_http {
                builder = builder.allow_insecure_http();
            }
            (builder.build()?, Vec::new(), None)
        }
    };

    if let Some(path) = &trust.ca_cert {
        config.trust = TrustSource::Explicit(std::fs::read(path)?);
    }
    for fp in &trust.fingerprints {
        fingerprints.push(parse_fingerprint(fp)?);
    }

    if let Some(auth) = auth {
        match (&auth.client_cert, &auth.client_key, &auth.username, &auth.password) {
            (Some(cert), Some(key), _, _) => {
                let identity = ClientIdentity::from_files(cert, key)?;
                identity.validate()?;
                config.auth = Some(AuthCredential::ClientCert(identity));
            }
            (_, _, Some(username), Some(password)) => {
                config.auth = Some(AuthCredential::Basic(HttpAuth::new(username, password)));
            }
            (_, _, Some(_), None) => {
                return Err("--username requires a password (--password or EST_PASSWORD)".into())
            }
            _ => {}
        }
    }

    Ok(Loaded {
        config,
        fingerprints,
        identity,
    })
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_command(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_command(cli: Cli) -> CliResult<()> {
    match &cli.command {
        Commands::Enroll {
            trust,
            auth,
            subject,
            output,
            key_output,
            csr_attrs,
            reenroll,
            new_key,
        } => {
            let loaded = load(&cli, trust, Some(auth))?;
            let options = EnrollOptions {
                output,
                key_output: key_output.clone().unwrap_or_else(|| output.with_extension("key")),
                csr_attrs: *csr_attrs,
                reenroll: *reenroll,
                new_key: *new_key,
                trust_on_first_use: trust.trust_on_first_use,
            };
            enroll(loaded, subject, options).await
        }
        Commands::CaInfo { trust, pem } => ca_info(load(&cli, trust, None)?, *pem).await,
        Commands::TestCsr {
            subject,
            key_output,
        } => test_csr(subject, key_output.as_deref()),
    }
}

struct EnrollOptions<'a> {
    output: &'a Path,
    key_output: PathBuf,
    csr_attrs: bool,
    reenroll: bool,
    new_key: bool,
    trust_on_first_use: bool,
}

async fn enroll(loaded: Loaded, subject: &SubjectArgs, options: EnrollOptions<'_>) -> CliResult<()> {
    let Loaded {
        mut config,
        fingerprints,
        identity,
    } = loaded;
    let identity = subject.identity(identity.as_ref())?;
    if let Some(key) = subject.key {
        config.key_spec = key;
    }
    if options.new_key {
        config.reenroll_key_policy = ReenrollKeyPolicy::Regenerate;
    }

    println!("Starting certificate enrollment...");
    println!("  Server: {}", config.server_url);
    println!("  Common Name: {}", identity.common_name);

    let mut session = EnrollmentSession::new(config);

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling enrollment");
            token.cancel();
        }
    });

    let needs_confirmation = {
        let anchor = session.resolve_trust().await?;
        println!("Trust anchor: {} certificate(s)", anchor.len());
        print_fingerprints(anchor)?;
        !anchor.is_trusted()
    };

    if needs_confirmation {
        if !fingerprints.is_empty() {
            session.confirm_fingerprints(&fingerprints)?;
            println!("  Bootstrap CA confirmed by fingerprint");
        } else if options.trust_on_first_use {
            tracing::warn!("Trusting bootstrap CA certificates without confirmation");
            session.confirm_trust_with(|_, _| true)?;
        } else {
            return Err(
                "bootstrap CA certificates must be confirmed with --fingerprint or --trust-on-first-use"
                    .into(),
            );
        }
    }

    if options.csr_attrs {
        let attrs = session.request_csr_attrs().await?;
        println!("Server requested {} CSR attribute(s)", attrs.len());
        for attr in &attrs.attributes {
            println!("  {} {}", attr.oid, attr.name().unwrap_or(""));
        }
    }

    println!("Generating CSR...");
    session.build_csr(identity)?;

    println!("Submitting enrollment request...");
    session.simple_enroll().await?;
    println!("Certificate issued successfully!");

    if options.reenroll {
        println!("Submitting re-enrollment request...");
        session.prepare_reenroll()?;
        session.simple_reenroll().await?;
        println!("Certificate renewed successfully!");
    }

    let outcome = session.finish()?;
    print!("{}", outcome.chain.describe());

    std::fs::write(options.output, &outcome.pem)?;
    write_private_key(&options.key_output, &outcome.key.private_key_pem())?;
    println!("  Certificate chain: {}", options.output.display());
    println!("  Private key: {}", options.key_output.display());

    Ok(())
}

async fn ca_info(loaded: Loaded, pem: bool) -> CliResult<()> {
    let transport = HttpTransport::from_config(&loaded.config);

    let chain = match &loaded.config.trust {
        TrustSource::Explicit(data) => {
            let anchor = TrustAnchor::from_pem_or_der(data)?;
            let der = transport.get_ca_certs(ServerTrust::Anchor(&anchor)).await?;
            decode_pkcs7(&der)?
        }
        TrustSource::Implicit => {
            let anchor = resolve_trust(None, &transport).await?;
            if !loaded.fingerprints.is_empty() {
                anchor.clone().confirm_fingerprints(&loaded.fingerprints)?;
                println!("Fingerprints confirmed");
            }
            CertificateChain::from_unordered(anchor.certificates().to_vec())
        }
    };

    println!("CA certificates: {}", chain.len());
    print!("{}", chain.describe());
    for (i, cert) in chain.iter().enumerate() {
        println!("[{}] SHA-256: {}", i, format_fingerprint(&compute_fingerprint(cert)?));
    }
    if pem {
        print!("{}", chain.to_pem()?);
    }
    Ok(())
}

fn test_csr(subject: &SubjectArgs, key_output: Option<&Path>) -> CliResult<()> {
    let identity = subject.identity(None)?;
    let (key, csr) = build_csr(&identity, subject.key.unwrap_or_default())?;

    print!("{}", csr.to_pem()?);
    if let Some(path) = key_output {
        write_private_key(path, &key.private_key_pem())?;
        println!("Private key: {}", path.display());
    }
    Ok(())
}

fn print_fingerprints(anchor: &TrustAnchor) -> CliResult<()> {
    for (cert, fp) in anchor.iter().zip(anchor.fingerprints()?) {
        println!("  {}", cert.tbs_certificate.subject);
        println!("    SHA-256: {}", format_fingerprint(&fp));
    }
    Ok(())
}

fn write_private_key(path: &Path, pem: &str) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // The creation mode does not apply to a file that already exists.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(pem.as_bytes())
}
