//! rustls client configuration for TLS over the SOCKS tunnel.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::error::TunnelError;

/// Per-request TLS parameters.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Name used for SNI and certificate verification instead of the host.
    pub server_name: Option<String>,
    /// Skip certificate verification (INSECURE).
    pub insecure: bool,
    /// Additional trust anchors on top of the system and webpki roots.
    pub extra_roots: Vec<CertificateDer<'static>>,
}

impl TlsOptions {
    /// Whether these options can share the default client config.
    pub fn uses_default_config(&self) -> bool {
        !self.insecure && self.extra_roots.is_empty()
    }

    /// Whether a session made with these options may serve later requests
    /// for the same target. A session verified against an overridden server
    /// name proves nothing about the target host itself.
    pub fn is_poolable(&self) -> bool {
        self.uses_default_config() && self.server_name.is_none()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(extra_roots: &[CertificateDer<'static>]) -> RootCertStore {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        debug!("Skipping native certificate source: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("Loaded {} native root(s), ignored {}", added, ignored);

    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    for cert in extra_roots {
        if let Err(e) = roots.add(cert.clone()) {
            debug!("Ignoring invalid extra root: {}", e);
        }
    }
    roots
}

/// Build a client config for the given options.
pub fn client_config(options: &TlsOptions) -> Result<Arc<ClientConfig>, TunnelError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::TlsConfig(e.to_string()))?;

    let mut config = if options.insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store(&options.extra_roots))
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Parse a host into a TLS server name. Accepts DNS names and IP literals.
pub fn server_name(host: &str) -> Result<ServerName<'static>, TunnelError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|_| TunnelError::InvalidServerName(host.to_string()))
}

/// Read every certificate from a PEM file.
pub fn load_pem_roots(path: &Path) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let file = File::open(path).map_err(|e| {
        TunnelError::TlsConfig(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::TlsConfig(format!("Failed to parse {}: {}", path.display(), e)))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipVerification {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
