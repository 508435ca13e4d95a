//! Throwaway self-signed TLS material for the QUIC endpoints
//!
//! A fresh certificate is generated on every start and never written to
//! disk. Both peers advertise a single ALPN token so that unrelated QUIC
//! clients fail protocol negotiation during the handshake.

use std::sync::Arc;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rcgen::{CertificateParams, DistinguishedName, KeyPair, SerialNumber, PKCS_ECDSA_P256_SHA256};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use thiserror::Error;
use tracing::debug;

/// Application protocol both peers must agree on
pub const ALPN: &[u8] = b"camera-quic-server";

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("key generation failed: {0}")]
    KeyGeneration(#[source] rcgen::Error),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[source] rcgen::Error),

    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),

    #[error("no QUIC-compatible cipher suite: {0}")]
    Quic(#[from] quinn::crypto::rustls::NoInitialCipherSuite),
}

/// Certificate, key and protocol token of one process run
#[derive(Debug)]
pub struct TlsConfig {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: Vec<u8>,
}

impl TlsConfig {
    /// Generates a self-signed identity advertising [`ALPN`]
    pub fn build() -> Result<Self, TlsError> {
        let key_pair =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(TlsError::KeyGeneration)?;

        let mut params =
            CertificateParams::new(Vec::<String>::new()).map_err(TlsError::CertificateGeneration)?;
        params.serial_number = Some(SerialNumber::from(1u64));
        params.distinguished_name = DistinguishedName::new();

        let cert = params
            .self_signed(&key_pair)
            .map_err(TlsError::CertificateGeneration)?;

        let (cert_chain, key) = load_key_pair(&cert.pem(), &key_pair.serialize_pem());
        debug!("Generated self-signed certificate");

        Ok(Self {
            cert_chain,
            key,
            alpn: ALPN.to_vec(),
        })
    }

    pub fn alpn(&self) -> &[u8] {
        &self.alpn
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    /// QUIC server configuration presenting this identity
    pub fn server_config(&self) -> Result<quinn::ServerConfig, TlsError> {
        let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        crypto.alpn_protocols = vec![self.alpn.clone()];

        Ok(quinn::ServerConfig::with_crypto(Arc::new(
            QuicServerConfig::try_from(crypto)?,
        )))
    }

    /// QUIC client configuration offering [`ALPN`]
    pub fn client_config() -> Result<quinn::ClientConfig, TlsError> {
        Self::client_config_with_alpn(ALPN)
    }

    /// QUIC client configuration offering `alpn`.
    ///
    /// The server certificate is not verified: it is self-signed and carries
    /// no identity.
    pub fn client_config_with_alpn(alpn: &[u8]) -> Result<quinn::ClientConfig, TlsError> {
        let mut crypto = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new()))
            .with_no_client_auth();
        crypto.alpn_protocols = vec![alpn.to_vec()];

        Ok(quinn::ClientConfig::new(Arc::new(
            QuicClientConfig::try_from(crypto)?,
        )))
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parses freshly encoded PEM back into rustls types.
///
/// The input was produced a moment ago by rcgen, so a failure here is a bug
/// rather than an operational condition.
fn load_key_pair(
    cert_pem: &str,
    key_pem: &str,
) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let cert_chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .expect("generated certificate PEM must parse");
    assert!(!cert_chain.is_empty(), "generated certificate PEM is empty");

    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .expect("generated key PEM must parse")
        .expect("generated key PEM must contain a private key");

    (cert_chain, key)
}

/// Accepts any server certificate
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Self {
        Self(provider())
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_advertises_single_alpn() {
        let tls = TlsConfig::build().unwrap();
        assert_eq!(tls.alpn(), b"camera-quic-server");
    }

    #[test]
    fn test_each_build_is_fresh() {
        let a = TlsConfig::build().unwrap();
        let b = TlsConfig::build().unwrap();
        assert_ne!(a.certificate().as_ref(), b.certificate().as_ref());
    }

    #[test]
    fn test_load_key_pair_roundtrip() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = CertificateParams::new(Vec::<String>::new())
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        let (chain, key) = load_key_pair(&cert.pem(), &key_pair.serialize_pem());
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].as_ref(), cert.der().as_ref());
        assert!(matches!(key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    #[should_panic(expected = "must contain a private key")]
    fn test_load_key_pair_without_key_panics() {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = CertificateParams::new(Vec::<String>::new())
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        load_key_pair(&cert.pem(), "");
    }

    #[test]
    fn test_server_and_client_configs() {
        let tls = TlsConfig::build().unwrap();
        assert!(tls.server_config().is_ok());
        assert!(TlsConfig::client_config().is_ok());
        assert!(TlsConfig::client_config_with_alpn(b"other-protocol").is_ok());
    }
}
