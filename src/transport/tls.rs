//! # TLS Transport Layer
//!
//! rustls configuration for TLS-enabled endpoints.
//!
//! Listeners present a certificate chain loaded from PEM files. Dialers verify
//! the server in one of three ways:
//! - against the platform's native roots, plus an optional extra CA file
//! - against a pinned SHA-256 fingerprint of the server certificate
//! - not at all (`accept_invalid_certs`, testing only)
//!
//! ## Responsibilities
//! - Load certificates and private keys
//! - Build acceptors and connectors from [`TlsSettings`]
//! - Run handshakes bounded by a timeout and a cancellation token

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::TlsSettings;
use crate::error::{ProtocolError, Result};
use crate::transport::stream::{boxed, BoxedStream, IoStream};
use crate::utils::timeout::guarded;

/// PEM label of an encrypted PKCS#8 key
const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// TLS server configuration
#[derive(Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
    key_password: Option<String>,
}

impl std::fmt::Debug for TlsServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerConfig")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .field("key_password", &self.key_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl TlsServerConfig {
    /// Create a new TLS server configuration
    pub fn new<P: AsRef<Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
            key_password: None,
        }
    }

    /// Decrypt the key with `password` when loading
    pub fn with_key_password<S: Into<String>>(mut self, password: S) -> Self {
        self.key_password = Some(password.into());
        self
    }

    /// Server material from endpoint settings
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        match (&settings.cert_path, &settings.key_path) {
            (Some(cert), Some(key)) => {
                let config = Self::new(cert, key);
                Ok(match &settings.key_password {
                    Some(password) => config.with_key_password(password.as_str()),
                    None => config,
                })
            }
            _ => Err(ProtocolError::ConfigError(
                "TLS listener requires cert_path and key_path".into(),
            )),
        }
    }

    /// Load the TLS configuration from files
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert_path)?;
        if cert_chain.is_empty() {
            return Err(ProtocolError::TlsError("No certificates found".into()));
        }
        let private_key = match &self.key_password {
            Some(password) => load_encrypted_private_key(&self.key_path, password)?,
            None => load_private_key(&self.key_path)?,
        };

        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))
    }

    /// Acceptor for inbound handshakes
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    ca_path: Option<String>,
    /// SHA-256 fingerprint of the only certificate to accept
    pinned_cert_hash: Option<Vec<u8>>,
    insecure: bool,
}

impl TlsClientConfig {
    /// Verify `server_name` against native roots
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            ca_path: None,
            pinned_cert_hash: None,
            insecure: false,
        }
    }

    /// Client settings for dialing `host`; `settings.server_name` overrides SNI
    pub fn from_settings(settings: &TlsSettings, host: &str) -> Result<Self> {
        let mut config = Self::new(settings.server_name.as_deref().unwrap_or(host));
        if let Some(ca) = &settings.ca_path {
            config = config.with_ca_file(ca.to_string_lossy());
        }
        if let Some(pin) = &settings.pinned_sha256 {
            config = config.with_pinned_cert_hash(parse_fingerprint(pin)?);
        }
        if settings.accept_invalid_certs {
            config = config.insecure();
        }
        Ok(config)
    }

    /// Trust the certificates in a PEM file in addition to native roots
    pub fn with_ca_file<S: Into<String>>(mut self, ca_path: S) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }

    /// Pin a certificate by its SHA-256 hash/fingerprint
    ///
    /// Only a server presenting exactly this certificate is accepted; CA
    /// verification is skipped.
    pub fn with_pinned_cert_hash(mut self, hash: Vec<u8>) -> Self {
        if hash.len() != 32 {
            warn!(
                "Certificate hash has unexpected length: {} (expected 32 bytes for SHA-256)",
                hash.len()
            );
        }
        self.pinned_cert_hash = Some(hash);
        self
    }

    /// Skip certificate verification entirely
    ///
    /// # WARNING: Security Risk
    /// Only for development and testing. Prefer a pinned hash.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.insecure = true;
        self
    }

    /// Calculate SHA-256 hash for a certificate to use with pinning
    pub fn calculate_cert_hash(cert: &Certificate) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&cert.0);
        hasher.finalize().to_vec()
    }

    /// Load the TLS client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder().with_safe_defaults();

        if let Some(hash) = &self.pinned_cert_hash {
            let verifier = Arc::new(CertificateFingerprint {
                fingerprint: hash.clone(),
            });
            return Ok(builder
                .with_custom_certificate_verifier(verifier)
                .with_no_client_auth());
        }

        if self.insecure {
            return Ok(builder
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth());
        }

        let mut root_store = RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(native_certs) => {
                for cert in native_certs {
                    if let Err(e) = root_store.add(&Certificate(cert.0)) {
                        debug!(error = %e, "Skipping unusable native root");
                    }
                }
            }
            Err(e) if self.ca_path.is_some() => {
                warn!(error = %e, "Failed to load native certs, using CA file only");
            }
            Err(e) => {
                return Err(ProtocolError::TlsError(format!(
                    "Failed to load native certs: {e}"
                )))
            }
        }

        if let Some(ca_path) = &self.ca_path {
            for cert in load_certs(ca_path)? {
                root_store.add(&cert).map_err(|e| {
                    ProtocolError::TlsError(format!("Failed to add CA cert: {e}"))
                })?;
            }
        }

        Ok(builder
            .with_root_certificates(root_store)
            .with_no_client_auth())
    }

    /// Connector for outbound handshakes
    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.load_client_config()?)))
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| ProtocolError::TlsError("Invalid server name".into()))
    }
}

struct CertificateFingerprint {
    fingerprint: Vec<u8>,
}

impl rustls::client::ServerCertVerifier for CertificateFingerprint {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        if TlsClientConfig::calculate_cert_hash(end_entity) == self.fingerprint {
            Ok(rustls::client::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "Pinned certificate hash mismatch".into(),
            ))
        }
    }
}

struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Parse a hex fingerprint, with or without `:` separators
pub fn parse_fingerprint(hex: &str) -> Result<Vec<u8>> {
    let clean: Vec<u8> = hex.bytes().filter(|b| *b != b':').collect();
    if clean.len() != 64 {
        return Err(ProtocolError::ConfigError(format!(
            "Invalid certificate fingerprint '{hex}'"
        )));
    }
    clean
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    ProtocolError::ConfigError(format!("Invalid certificate fingerprint '{hex}'"))
                })
        })
        .collect()
}

/// Hex SHA-256 fingerprint of the first certificate in a PEM file
pub fn fingerprint_of_pem<P: AsRef<Path>>(path: P) -> Result<String> {
    let chain = load_certs(path)?;
    let first = chain
        .first()
        .ok_or_else(|| ProtocolError::TlsError("No certificates found".into()))?;
    Ok(TlsClientConfig::calculate_cert_hash(first)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

fn load_certs<P: AsRef<Path>>(path: P) -> Result<Vec<Certificate>> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
    let mut reader = BufReader::new(file);
    let chain = certs(&mut reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?;
    Ok(chain.into_iter().map(Certificate).collect())
}

fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKey> {
    let path = path.as_ref();
    let open = || {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))
    };

    let keys = pkcs8_private_keys(&mut open()?)
        .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(PrivateKey(key));
    }

    let keys = rsa_private_keys(&mut open()?)
        .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?;
    keys.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| ProtocolError::TlsError("No private keys found".into()))
}

/// Decrypt a PEM `ENCRYPTED PRIVATE KEY` (PKCS#8, PBES2)
fn load_encrypted_private_key<P: AsRef<Path>>(path: P, password: &str) -> Result<PrivateKey> {
    let pem = std::fs::read_to_string(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
    let (label, document) = pkcs8::Document::from_pem(&pem)
        .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(ProtocolError::TlsError(format!(
            "Key password given but the key is not encrypted ({label})"
        )));
    }

    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|_| ProtocolError::TlsError("Failed to parse encrypted private key".into()))?;
    let secret = encrypted
        .decrypt(password)
        .map_err(|_| ProtocolError::TlsError("Failed to decrypt private key".into()))?;
    Ok(PrivateKey(secret.as_bytes().to_vec()))
}

/// Server side of a handshake on an accepted connection
#[instrument(skip_all)]
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<BoxedStream> {
    let tls = guarded(
        async {
            acceptor
                .accept(stream)
                .await
                .map_err(|e| ProtocolError::TlsError(format!("TLS handshake failed: {e}")))
        },
        timeout,
        cancel,
    )
    .await?;
    debug!("TLS session accepted");
    Ok(boxed(tls))
}

/// Client side of a handshake over any established stream
#[instrument(skip_all)]
pub async fn connect<S: IoStream + 'static>(
    connector: &TlsConnector,
    server_name: ServerName,
    stream: S,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<BoxedStream> {
    let tls = guarded(
        async {
            connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))
        },
        timeout,
        cancel,
    )
    .await?;
    debug!("TLS session established");
    Ok(boxed(tls))
}
