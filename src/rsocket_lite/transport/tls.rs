//! TLS client configuration.
//!
//! Trust and identity material are passed explicitly per connection. Nothing here touches
//! process-wide state apart from the crypto provider rustls selects from its crate features.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, warn};

use crate::rsocket_lite::error::TransportError;

/// Which server certificates the client accepts.
#[derive(Debug, Clone, Default)]
pub enum TrustConfig {
    /// The platform's native root store.
    #[default]
    NativeRoots,
    /// A PEM bundle of trusted certificates.
    TrustStore(PathBuf),
    /// Trusted certificates already in memory.
    Certificates(Vec<CertificateDer<'static>>),
    /// Accept any server certificate. Development only.
    InsecureTrustAll,
}

/// Client certificate presented for mutual TLS.
#[derive(Debug, Clone)]
pub enum ClientIdentity {
    /// PEM files holding the certificate chain and the private key.
    Pem {
        cert_chain: PathBuf,
        private_key: PathBuf,
    },
    /// DER material already in memory.
    Der {
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: Arc<PrivateKeyDer<'static>>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub trust: TrustConfig,
    pub identity: Option<ClientIdentity>,
    /// Name to verify the server certificate against. Defaults to the dialed host.
    pub server_name: Option<String>,
}

impl TlsConfig {
    /// A config that skips server certificate verification.
    pub fn insecure() -> Self {
        Self {
            trust: TrustConfig::InsecureTrustAll,
            ..Self::default()
        }
    }

    pub fn is_insecure(&self) -> bool {
        matches!(self.trust, TrustConfig::InsecureTrustAll)
    }

    /// Build the rustls client config described by this struct.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TransportError> {
        let builder = ClientConfig::builder();

        let builder = match &self.trust {
            TrustConfig::InsecureTrustAll => {
                warn!("TLS server certificate verification is disabled");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
            }
            trust => builder.with_root_certificates(root_store(trust)?),
        };

        let config = match &self.identity {
            Some(identity) => {
                let (cert_chain, private_key) = identity.load()?;
                builder.with_client_auth_cert(cert_chain, private_key)?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

impl ClientIdentity {
    fn load(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
        match self {
            ClientIdentity::Pem {
                cert_chain,
                private_key,
            } => {
                let certs = load_certs(cert_chain)?;
                let key = PrivateKeyDer::from_pem_file(private_key)
                    .map_err(|e| material_error(private_key, e))?;
                Ok((certs, key))
            }
            ClientIdentity::Der {
                cert_chain,
                private_key,
            } => Ok((cert_chain.clone(), private_key.clone_key())),
        }
    }
}

fn root_store(trust: &TrustConfig) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();

    match trust {
        TrustConfig::NativeRoots => {
            let native = rustls_native_certs::load_native_certs();
            for error in &native.errors {
                warn!(error = %error, "Failed to load some native root certificates");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!(added, ignored, "Loaded native root certificates");
        }
        TrustConfig::TrustStore(path) => {
            let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
            debug!(path = %path.display(), added, ignored, "Loaded trust store");
        }
        TrustConfig::Certificates(certs) => {
            roots.add_parsable_certificates(certs.iter().cloned());
        }
        TrustConfig::InsecureTrustAll => {}
    }

    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    CertificateDer::pem_file_iter(path)
        .map_err(|e| material_error(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| material_error(path, e))
}

fn material_error(path: &Path, reason: impl std::fmt::Display) -> TransportError {
    TransportError::TlsMaterial {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[derive(Debug)]
struct NoVerifier;

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

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
