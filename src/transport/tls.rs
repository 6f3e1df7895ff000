//! rustls configuration for both roles.
//!
//! The server presents one certificate and never asks for a client
//! certificate. The client decides how to treat the server certificate
//! through a [`TrustPolicy`].

use crate::certs::{fingerprint, Certificate};
use crate::error::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// How the client decides whether to accept the server certificate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrustPolicy {
    /// Accept every certificate, whatever its chain, expiry or name.
    ///
    /// Insecure. This only guarantees an encrypted channel, not who is
    /// on the other end of it.
    #[default]
    AcceptAny,
    /// Verify against the bundled Mozilla root set.
    SystemRoots,
    /// Accept only the end-entity certificate with this SHA-256.
    PinnedFingerprint(Fingerprint),
}

/// A SHA-256 certificate fingerprint in upper-case hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(der: &[u8]) -> Self {
        Fingerprint(fingerprint(der))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    /// Accepts hex in either case, optionally separated by `:`.
    fn from_str(s: &str) -> Result<Self> {
        let hex: String = s
            .chars()
            .filter(|c| *c != ':' && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Argument(format!(
                "'{s}' is not a SHA-256 fingerprint (64 hex digits)"
            )));
        }
        Ok(Fingerprint(hex))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(e: rustls::Error) -> Error {
    Error::TlsHandshake(e.to_string())
}

/// Build the client configuration for `policy`.
pub fn client_config(policy: &TrustPolicy) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let algorithms = provider.signature_verification_algorithms;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let config = match policy {
        TrustPolicy::SystemRoots => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TrustPolicy::AcceptAny => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PeerVerifier {
                pin: None,
                algorithms,
            }))
            .with_no_client_auth(),
        TrustPolicy::PinnedFingerprint(pin) => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PeerVerifier {
                pin: Some(pin.clone()),
                algorithms,
            }))
            .with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Build the server configuration presenting `certificate`.
pub fn server_config(certificate: &Certificate) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .with_no_client_auth()
        .with_single_cert(certificate.chain().to_vec(), certificate.clone_key())
        .map_err(tls_error)?;
    Ok(Arc::new(config))
}

/// Parse the name sent in SNI and used for hostname checks.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Argument(format!("invalid TLS server name '{host}': {e}")))
}

/// Server certificate check used for `AcceptAny` and `PinnedFingerprint`.
///
/// Handshake signatures are always verified, so the peer has to hold the
/// key for the certificate it presents.
#[derive(Debug)]
struct PeerVerifier {
    pin: Option<Fingerprint>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match &self.pin {
            Some(pin) if Fingerprint::of(end_entity.as_ref()) != *pin => Err(
                rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure),
            ),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
