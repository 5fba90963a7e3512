//! # TLS Transport Layer
//!
//! Client-side TLS for LDAPS connections and in-place StartTLS upgrades.
//!
//! ## Responsibilities
//! - Build a rustls client configuration from roots, a CA file, a pinned
//!   fingerprint or insecure mode
//! - Present a client certificate when one is configured (mTLS)
//! - Run the handshake over an already-open byte stream

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use rustls_pemfile::Item;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::error::{LdapError, Result};

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    server_name: String,
    insecure: bool,
    /// SHA-256 fingerprint the server certificate must match
    pinned_cert_hash: Option<Vec<u8>>,
    /// PEM bundle replacing the native root store
    ca_file: Option<PathBuf>,
    client_cert_path: Option<PathBuf>,
    client_key_path: Option<PathBuf>,
}

impl TlsClientConfig {
    /// Create a new TLS client configuration verifying against native roots
    pub fn new<S: Into<String>>(server_name: S) -> Self {
        Self {
            server_name: server_name.into(),
            insecure: false,
            pinned_cert_hash: None,
            ca_file: None,
            client_cert_path: None,
            client_key_path: None,
        }
    }

    /// Trust only the certificates in this PEM file
    pub fn with_ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Configure client authentication for mTLS
    pub fn with_client_certificate<P: AsRef<Path>>(mut self, cert_path: P, key_path: P) -> Self {
        self.client_cert_path = Some(cert_path.as_ref().to_path_buf());
        self.client_key_path = Some(key_path.as_ref().to_path_buf());
        self
    }

    /// Skip certificate verification.
    ///
    /// # WARNING: Security Risk
    /// Any server certificate is accepted unless a fingerprint is pinned with
    /// [`with_pinned_cert_hash`](Self::with_pinned_cert_hash). Use only for
    /// development and testing.
    pub fn insecure(mut self) -> Self {
        warn!("INSECURE MODE ENABLED: Certificate verification is disabled. This should only be used for development/testing.");
        self.insecure = true;
        self
    }

    /// Accept only a server certificate with this SHA-256 fingerprint.
    ///
    /// Pinning replaces CA verification in both secure and insecure mode.
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

    /// Calculate SHA-256 hash for a certificate to use with pinning
    pub fn calculate_cert_hash(cert: &Certificate) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&cert.0);
        hasher.finalize().to_vec()
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut root_store = RootCertStore::empty();
        match &self.ca_file {
            Some(path) => {
                let certs = load_certs(path)?;
                if certs.is_empty() {
                    return Err(LdapError::TlsError(format!(
                        "No certificates found in CA file {}",
                        path.display()
                    )));
                }
                for cert in &certs {
                    root_store.add(cert).map_err(|e| {
                        LdapError::TlsError(format!("Failed to add CA cert: {e}"))
                    })?;
                }
                debug!(path = %path.display(), count = certs.len(), "Loaded CA file");
            }
            None => {
                let native_certs = rustls_native_certs::load_native_certs().map_err(|e| {
                    LdapError::TlsError(format!("Failed to load native certs: {e}"))
                })?;
                for cert in native_certs {
                    // Unparseable platform roots are skipped rather than failing the connection
                    if let Err(e) = root_store.add(&Certificate(cert.0)) {
                        debug!(error = %e, "Skipping native root certificate");
                    }
                }
            }
        }
        Ok(root_store)
    }

    fn client_identity(&self) -> Result<Option<(Vec<Certificate>, PrivateKey)>> {
        let (Some(cert_path), Some(key_path)) = (&self.client_cert_path, &self.client_key_path)
        else {
            return Ok(None);
        };

        let chain = load_certs(cert_path)?;
        if chain.is_empty() {
            return Err(LdapError::TlsError("No client certificates found".into()));
        }
        let key = load_private_key(key_path)?;
        Ok(Some((chain, key)))
    }

    /// Load the rustls client configuration
    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let identity = self.client_identity()?;
        let builder = ClientConfig::builder().with_safe_defaults();

        // Custom verifiers and root stores leave the builder in different states
        let config = if let Some(hash) = &self.pinned_cert_hash {
            let verified = builder.with_custom_certificate_verifier(Arc::new(
                CertificateFingerprint {
                    fingerprint: hash.clone(),
                },
            ));
            match identity {
                Some((chain, key)) => verified.with_client_auth_cert(chain, key),
                None => Ok(verified.with_no_client_auth()),
            }
        } else if self.insecure {
            let verified = builder.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert));
            match identity {
                Some((chain, key)) => verified.with_client_auth_cert(chain, key),
                None => Ok(verified.with_no_client_auth()),
            }
        } else {
            let verified = builder.with_root_certificates(self.root_store()?);
            match identity {
                Some((chain, key)) => verified.with_client_auth_cert(chain, key),
                None => Ok(verified.with_no_client_auth()),
            }
        };

        config.map_err(|e| LdapError::TlsError(format!("Failed to set client certificate: {e}")))
    }

    /// Get the server name as a rustls::ServerName
    pub fn server_name(&self) -> Result<ServerName> {
        ServerName::try_from(self.server_name.as_str())
            .map_err(|_| LdapError::TlsError(format!("Invalid server name: {}", self.server_name)))
    }

    /// Run the client handshake over `io`
    #[instrument(skip(self, io), fields(server_name = %self.server_name))]
    pub async fn handshake<IO>(&self, io: IO) -> Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let connector = TlsConnector::from(Arc::new(self.load_client_config()?));
        let domain = self.server_name()?;
        let stream = connector
            .connect(domain, io)
            .await
            .map_err(|e| LdapError::TlsError(format!("TLS handshake failed: {e}")))?;
        debug!("TLS handshake complete");
        Ok(stream)
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

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| LdapError::TlsError(format!("Failed to open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|_| LdapError::TlsError("Failed to parse certificate".into()))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

/// First PKCS#8, RSA or SEC1 key in the file
fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let mut reader = open(path)?;
    let items = rustls_pemfile::read_all(&mut reader)
        .map_err(|_| LdapError::TlsError("Failed to parse private key".into()))?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| LdapError::TlsError("No supported private key format found".into()))
}
