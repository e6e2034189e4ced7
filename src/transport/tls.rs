//! TLS material loading for both sub-clients
//!
//! When TLS is enabled a well-formed client keypair is mandatory; a CA
//! bundle is optional (the platform's native root store is used
//! otherwise). Minimum protocol version is TLS 1.2 on both the HTTP and
//! WebSocket paths.

use crate::config::TlsSection;
use crate::transport::TransportError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Load the PEM certificates at `path`
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("invalid certificate in {}: {e}", path.display())))
}

/// Load the PEM private key at `path`
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)
        .map_err(|e| TransportError::Tls(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("invalid private key in {}: {e}", path.display())))?
        .ok_or_else(|| {
            TransportError::Tls(format!("no private key found in {}", path.display()))
        })
}

/// Root store from the configured CA bundle, or the platform's native
/// certificate store when none is configured
fn build_root_store(section: &TlsSection) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    match &section.ca_path {
        Some(ca_path) => {
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("cannot add CA certificate: {e}")))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs();
            for cert in native.certs {
                // Individual unparsable platform certs are skipped
                let _ = roots.add(cert);
            }
            if roots.is_empty() {
                return Err(TransportError::Tls(
                    "no usable roots in the native certificate store".to_string(),
                ));
            }
        }
    }
    Ok(roots)
}

/// Build the rustls client configuration used by the WebSocket connector
pub fn build_client_config(section: &TlsSection) -> Result<ClientConfig, TransportError> {
    let certs = load_certs(&section.cert_path)?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in {}",
            section.cert_path.display()
        )));
    }
    let key = load_key(&section.key_path)?;

    // Pin the crypto provider so the build never depends on which
    // provider features other dependencies enable
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TransportError::Tls(format!("cannot select protocol versions: {e}")))?;

    let config = if section.skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_client_auth_cert(certs, key)
    } else {
        let roots = build_root_store(section)?;
        builder
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
    }
    .map_err(|e| TransportError::Tls(format!("cannot configure client auth: {e}")))?;

    Ok(config)
}

/// Apply the TLS section to a reqwest client builder
pub fn apply_to_reqwest(
    builder: reqwest::ClientBuilder,
    section: &TlsSection,
) -> Result<reqwest::ClientBuilder, TransportError> {
    let cert_pem = std::fs::read(&section.cert_path).map_err(|e| {
        TransportError::Tls(format!("cannot read {}: {e}", section.cert_path.display()))
    })?;
    let key_pem = std::fs::read(&section.key_path).map_err(|e| {
        TransportError::Tls(format!("cannot read {}: {e}", section.key_path.display()))
    })?;

    // reqwest's rustls identity expects key and certificate in one PEM buffer
    let mut identity_pem = key_pem;
    identity_pem.extend_from_slice(&cert_pem);
    let identity = reqwest::Identity::from_pem(&identity_pem)
        .map_err(|e| TransportError::Tls(format!("invalid client keypair: {e}")))?;

    let mut builder = builder
        .identity(identity)
        .min_tls_version(reqwest::tls::Version::TLS_1_2);

    if let Some(ca_path) = &section.ca_path {
        let ca_pem = std::fs::read(ca_path)
            .map_err(|e| TransportError::Tls(format!("cannot read {}: {e}", ca_path.display())))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem)
            .map_err(|e| TransportError::Tls(format!("invalid CA bundle: {e}")))?;
        builder = builder.add_root_certificate(ca);
    }

    if section.skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    Ok(builder)
}

/// Verifier that accepts any server certificate (skip-verify mode)
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
