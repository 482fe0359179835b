//! TLS trust assembly for upstream connections.
//!
//! This module builds the client-side trust material: system roots plus any
//! user-supplied CAs, optional per-host client identities, and a no-op
//! verifier for hosts whose certificate errors are deliberately ignored.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore};
use tracing::warn;

/// No-op certificate verifier for upstreams whose TLS errors are ignored.
///
/// # Warning
/// This disables all TLS security checks for the hosts it is applied to.
#[derive(Debug)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Load the platform's root certificates into a fresh store.
///
/// Unloadable roots are logged and skipped rather than failing the whole
/// store, matching how browsers treat a partially broken system store.
pub fn system_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!("Failed to load a system trust root: {}", error);
    }
    for cert in native.certs {
        if let Err(error) = roots.add(cert) {
            warn!("Rejected system trust root: {}", error);
        }
    }
    roots
}

/// Parse every certificate in a PEM bundle.
pub fn parse_pem_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, anyhow::Error> {
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut &*pem)
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse PEM certificate: {e}"))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }
    Ok(certs)
}

/// Parse a PEM client certificate chain and private key for mutual TLS.
pub fn parse_client_identity(
    cert_pem: &str,
    key_pem: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), anyhow::Error> {
    let certs = parse_pem_certificates(cert_pem.as_bytes())?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to parse client private key: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in client certificate entry"))?;
    Ok((certs, key))
}
