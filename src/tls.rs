//! Hardened TLS client context for the broker connection
//!
//! Builds a rustls client configuration from [`TlsSection`]: CA trust
//! anchors, a protocol version floor, the peer verification mode and an
//! optional client identity for mutual TLS.

use crate::config::{TlsSection, VerifyMode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// TLS context construction errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("No CA certificate file configured (tls.ca_certs)")]
    MissingCaFile,
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("No private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("Invalid CA certificate in {path}: {reason}")]
    InvalidCaCertificate { path: PathBuf, reason: String },
    #[error("Client identity requires both tls.certfile and tls.keyfile")]
    IncompleteClientIdentity,
    #[error("Unsupported minimum TLS version: {0} (TLSv1.2 or TLSv1.3 required)")]
    UnsupportedVersion(String),
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Negotiable protocol floor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    /// Parse a configured floor. Anything older than TLS 1.2 is refused.
    pub fn parse(value: &str) -> Result<Self, TlsError> {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', ' '], "");
        match normalized.as_str() {
            "tlsv1.2" | "tls1.2" | "1.2" => Ok(TlsVersion::Tls12),
            "tlsv1.3" | "tls1.3" | "1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::UnsupportedVersion(value.to_string())),
        }
    }

    /// Versions offered in the handshake; everything below the floor is absent
    pub fn enabled_versions(self) -> &'static [&'static rustls::SupportedProtocolVersion] {
        static FROM_TLS12: &[&rustls::SupportedProtocolVersion] =
            &[&rustls::version::TLS13, &rustls::version::TLS12];
        static FROM_TLS13: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
        match self {
            TlsVersion::Tls12 => FROM_TLS12,
            TlsVersion::Tls13 => FROM_TLS13,
        }
    }
}

/// Ready-to-use client TLS context
#[derive(Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    min_version: TlsVersion,
    mutual: bool,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("min_version", &self.min_version)
            .field("mutual", &self.mutual)
            .finish()
    }
}

impl TlsContext {
    /// Build the context from configuration
    pub fn build(section: &TlsSection) -> Result<Self, TlsError> {
        let min_version = TlsVersion::parse(&section.min_version)?;
        let ca_path = section.ca_certs.as_deref().ok_or(TlsError::MissingCaFile)?;
        let roots = load_root_store(ca_path)?;

        let identity = match (&section.certfile, &section.keyfile) {
            (Some(cert), Some(key)) => Some((load_cert_chain(cert)?, load_private_key(key)?)),
            (None, None) => None,
            _ => return Err(TlsError::IncompleteClientIdentity),
        };
        let mutual = identity.is_some();

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(min_version.enabled_versions())?
            .with_root_certificates(roots);

        let mut config = match identity {
            Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
            None => builder.with_no_client_auth(),
        };

        if section.verify_mode == VerifyMode::None {
            warn!("TLS peer verification disabled; broker certificate will not be checked");
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
        }

        info!(
            min_version = ?min_version,
            mutual_tls = mutual,
            verify_mode = ?section.verify_mode,
            "TLS context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            min_version,
            mutual,
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    pub fn min_version(&self) -> TlsVersion {
        self.min_version
    }

    /// True when a client certificate will be presented
    pub fn is_mutual(&self) -> bool {
        self.mutual
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_cert_chain(path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::InvalidCaCertificate {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
    }
    Ok(roots)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Verifier installed when `verify_mode = "none"`. Handshake signatures are
/// still checked so the session keys stay bound to the presented key.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
