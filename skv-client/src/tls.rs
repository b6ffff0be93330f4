//! # TLS Context Factory
//!
//! Purpose: Build the rustls client configuration a pool wraps its
//! connections in, from one of a few named trust modes.
//!
//! ## Trust modes
//! - `with_ca_certificate`: one CA certificate from disk is the only trust
//!   anchor. This is the mode for managed instances with their own CA.
//! - `with_system_roots`: the bundled webpki root set.
//! - `insecure_trust_all`: accepts any server certificate. Test and local
//!   setups only; every construction logs a security warning.
//!
//! No client certificate is ever presented.

use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, ConfigBuilder, DigitallySignedStruct, RootCertStore,
    SignatureScheme, StreamOwned, WantsVerifier,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ClientResult};

/// Errors raised while building a TLS context.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Certificate file missing, unreadable, or not a certificate.
    #[error("failed to load certificate {}: {reason}", .path.display())]
    CertificateLoad { path: PathBuf, reason: String },
    /// Trust store or protocol configuration could not be initialized.
    #[error("failed to initialize trust store: {0}")]
    TrustStore(String),
}

/// How a context decides whether to trust a server certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustMode {
    /// Every certificate is accepted.
    InsecureTrustAll,
    /// Only chains ending in the configured CA certificate are accepted.
    CaCertificate,
    /// Chains ending in a bundled public root are accepted.
    SystemRoots,
}

/// Shareable TLS client context.
#[derive(Debug, Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
    mode: TrustMode,
}

impl TlsContext {
    /// Builds a context that skips certificate verification entirely.
    ///
    /// **DANGEROUS:** only for test environments with self-signed certificates.
    pub fn insecure_trust_all() -> Result<Self, TlsError> {
        warn!("SECURITY WARNING: TLS certificate verification disabled for backend connections");

        let provider = Arc::new(ring::default_provider());
        let config = protocol_versions(provider.clone())?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
            .with_no_client_auth();

        Ok(TlsContext {
            config: Arc::new(config),
            mode: TrustMode::InsecureTrustAll,
        })
    }

    /// Builds a context whose sole trust anchor is the certificate at
    /// `cert_path`.
    pub fn with_ca_certificate(cert_path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let cert_path = cert_path.as_ref();
        let anchor = load_single_certificate(cert_path)?;

        let mut roots = RootCertStore::empty();
        roots.add(anchor).map_err(|err| TlsError::CertificateLoad {
            path: cert_path.to_path_buf(),
            reason: err.to_string(),
        })?;

        let config = protocol_versions(Arc::new(ring::default_provider()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        info!(ca_file = %cert_path.display(), "Loaded CA certificate as sole trust anchor");

        Ok(TlsContext {
            config: Arc::new(config),
            mode: TrustMode::CaCertificate,
        })
    }

    /// Builds a context that trusts the bundled webpki root certificates.
    pub fn with_system_roots() -> Result<Self, TlsError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if roots.is_empty() {
            return Err(TlsError::TrustStore("bundled root set is empty".to_string()));
        }

        let config = protocol_versions(Arc::new(ring::default_provider()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsContext {
            config: Arc::new(config),
            mode: TrustMode::SystemRoots,
        })
    }

    /// Returns how this context trusts server certificates.
    pub fn mode(&self) -> TrustMode {
        self.mode
    }

    /// Wraps `tcp` in TLS for `server_name` and completes the handshake.
    pub fn connect(
        &self,
        server_name: &str,
        mut tcp: TcpStream,
    ) -> ClientResult<StreamOwned<ClientConnection, TcpStream>> {
        let name = ServerName::try_from(server_name)
            .map_err(|_| ClientError::InvalidAddress(server_name.to_string()))?
            .to_owned();
        let mut conn = ClientConnection::new(self.config.clone(), name)
            .map_err(|err| ClientError::Handshake(err.to_string()))?;

        // Finish the handshake now so certificate failures surface at connect
        // time rather than on the first command.
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|err| ClientError::Handshake(err.to_string()))?;
        }
        debug!(server_name, mode = ?self.mode, "TLS handshake complete");

        Ok(StreamOwned::new(conn, tcp))
    }
}

fn protocol_versions(
    provider: Arc<CryptoProvider>,
) -> Result<ConfigBuilder<ClientConfig, WantsVerifier>, TlsError> {
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| TlsError::TrustStore(err.to_string()))
}

/// Reads the first certificate from a PEM file, or the whole file as DER when
/// it holds no PEM blocks.
fn load_single_certificate(path: &Path) -> Result<CertificateDer<'static>, TlsError> {
    let load_err = |reason: String| TlsError::CertificateLoad {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = fs::read(path).map_err(|err| load_err(err.to_string()))?;
    let mut pem = rustls_pemfile::certs(&mut bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| load_err(err.to_string()))?;

    if pem.is_empty() {
        // A DER certificate starts with an ASN.1 SEQUENCE tag.
        return match bytes.first() {
            Some(0x30) => Ok(CertificateDer::from(bytes)),
            _ => Err(load_err("no certificate found".to_string())),
        };
    }
    if pem.len() > 1 {
        debug!(
            ca_file = %path.display(),
            ignored = pem.len() - 1,
            "Using the first certificate of the bundle"
        );
    }
    Ok(pem.swap_remove(0))
}

/// Certificate verifier that accepts all certificates without validation.
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents).expect("write");
        file
    }

    #[test]
    fn trust_all_is_labeled_insecure() {
        let ctx = TlsContext::insecure_trust_all().expect("context");
        assert_eq!(ctx.mode(), TrustMode::InsecureTrustAll);
    }

    #[test]
    fn system_roots_context_builds() {
        let ctx = TlsContext::with_system_roots().expect("context");
        assert_eq!(ctx.mode(), TrustMode::SystemRoots);
    }

    #[test]
    fn missing_file_is_certificate_load_error() {
        let err = TlsContext::with_ca_certificate("/nonexistent/ca.pem").unwrap_err();
        assert!(matches!(err, TlsError::CertificateLoad { .. }));
    }

    #[test]
    fn text_file_is_certificate_load_error() {
        let file = write_temp(b"this is not a certificate\n");
        let err = TlsContext::with_ca_certificate(file.path()).unwrap_err();
        assert!(matches!(err, TlsError::CertificateLoad { .. }));
    }

    #[test]
    fn pem_with_garbage_body_is_certificate_load_error() {
        let file = write_temp(b"-----BEGIN CERTIFICATE-----\nAAAAAAAA\n-----END CERTIFICATE-----\n");
        let err = TlsContext::with_ca_certificate(file.path()).unwrap_err();
        assert!(matches!(err, TlsError::CertificateLoad { .. }));
    }

    #[test]
    fn error_message_names_the_file() {
        let err = TlsContext::with_ca_certificate("/nonexistent/ca.pem").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }
}
