//! TLS configuration for listeners and connectors.
//!
//! Certificates and keys are read from PEM files:
//!
//! - a *key store* holds a certificate chain, leaf first, followed by
//!   the matching private key.
//! - a *trust store* holds one or more trusted CA certificates.
//!
//! [TlsSettings] is the flat, serializable form found in config files.
//! It converts into [ServerTlsConfig] or [ClientTlsConfig], which are
//! what [crate::Listener] and [crate::Connector] take.

use crate::error::TlsConfigError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::pem::PemObject as _;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub use rustls::crypto::aws_lc_rs::default_provider;

/// PEM file containing a certificate chain and its private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyStore {
    path: PathBuf,
    password: Option<String>,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            password: None,
        }
    }

    /// Set the key store password.
    ///
    /// PEM key stores are not encrypted, so the password is only
    /// kept for configuration compatibility; loading a store that has
    /// one logs a warning.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsConfigError> {
        warn_if_password(&self.path, &self.password);
        let certs = read_certificates(&self.path)?;
        let key = PrivateKeyDer::from_pem_file(&self.path).map_err(|source| {
            TlsConfigError::Pem {
                path: self.path.clone(),
                source,
            }
        })?;

        Ok((certs, key))
    }
}

/// PEM file containing trusted CA certificates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustStore {
    path: PathBuf,
    password: Option<String>,
}

impl TrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            password: None,
        }
    }

    /// Set the trust store password. See [KeyStore::with_password].
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RootCertStore, TlsConfigError> {
        warn_if_password(&self.path, &self.password);
        let mut roots = RootCertStore::empty();
        for cert in read_certificates(&self.path)? {
            roots.add(cert)?;
        }

        Ok(roots)
    }
}

/// How a client decides whether to trust the server certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerTrust {
    /// Only accept certificate chains rooted in the trust store.
    Store(TrustStore),

    /// Accept any server certificate.
    ///
    /// This is insecure: anyone between the client and the server can
    /// impersonate the server. Handshake signatures are still checked,
    /// but the identity of the server isn't.
    InsecureTrustAll,
}

/// Whether a listener asks connecting clients for a certificate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuth {
    /// Don't ask for client certificates.
    #[default]
    None,

    /// Verify a client certificate against the trust store if the
    /// client sends one; accept clients that don't.
    Request,

    /// Reject clients that don't present a certificate trusted by the
    /// trust store.
    Required,
}

/// TLS configuration of a [crate::Listener].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerTlsConfig {
    key_store: KeyStore,
    trust_store: Option<TrustStore>,
    client_auth: ClientAuth,
}

impl ServerTlsConfig {
    pub fn new(key_store: KeyStore) -> Self {
        Self {
            key_store,
            trust_store: None,
            client_auth: ClientAuth::None,
        }
    }

    /// Trust store used to verify client certificates.
    pub fn with_trust_store(mut self, trust_store: TrustStore) -> Self {
        self.trust_store = Some(trust_store);
        self
    }

    pub fn with_client_auth(mut self, client_auth: ClientAuth) -> Self {
        self.client_auth = client_auth;
        self
    }
}

/// TLS configuration of a [crate::Connector].
///
/// There's no default; choosing between [ClientTlsConfig::trusting]
/// and [ClientTlsConfig::insecure_trust_all] is always explicit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientTlsConfig {
    key_store: Option<KeyStore>,
    trust: PeerTrust,
}

impl ClientTlsConfig {
    /// Accept servers whose certificate chain is rooted in the trust
    /// store.
    pub fn trusting(trust_store: TrustStore) -> Self {
        Self {
            key_store: None,
            trust: PeerTrust::Store(trust_store),
        }
    }

    /// Accept any server certificate. See [PeerTrust::InsecureTrustAll].
    pub fn insecure_trust_all() -> Self {
        Self {
            key_store: None,
            trust: PeerTrust::InsecureTrustAll,
        }
    }

    /// Certificate presented to servers that ask for one.
    pub fn with_key_store(mut self, key_store: KeyStore) -> Self {
        self.key_store = Some(key_store);
        self
    }

    pub fn trust(&self) -> &PeerTrust {
        &self.trust
    }
}

/// TLS settings, as found in config files.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(deny_unknown_fields)]
pub struct TlsSettings {
    /// Connectors: connect with TLS. Listeners: run the handshake
    /// as soon as a connection is accepted.
    #[serde(default)]
    pub enabled: bool,

    pub key_store_path: Option<PathBuf>,
    pub key_store_password: Option<String>,
    pub trust_store_path: Option<PathBuf>,
    pub trust_store_password: Option<String>,

    /// Accept any server certificate. Insecure; only meaningful for
    /// connectors.
    #[serde(default)]
    pub trust_all: bool,
}

impl TlsSettings {
    /// Build the configuration of a connector.
    ///
    /// Returns None if TLS isn't enabled.
    pub fn client_config(&self) -> Result<Option<ClientTlsConfig>, TlsConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        let mut config = if self.trust_all {
            ClientTlsConfig::insecure_trust_all()
        } else {
            ClientTlsConfig::trusting(
                self.trust_store()
                    .ok_or(TlsConfigError::MissingTrustStore)?,
            )
        };
        if let Some(key_store) = self.key_store() {
            config = config.with_key_store(key_store);
        }

        Ok(Some(config))
    }

    /// Build the configuration of a listener.
    pub fn server_config(&self, client_auth: ClientAuth) -> Result<ServerTlsConfig, TlsConfigError> {
        let mut config =
            ServerTlsConfig::new(self.key_store().ok_or(TlsConfigError::MissingKeyStore)?)
                .with_client_auth(client_auth);
        if let Some(trust_store) = self.trust_store() {
            config = config.with_trust_store(trust_store);
        }

        Ok(config)
    }

    fn key_store(&self) -> Option<KeyStore> {
        self.key_store_path.as_ref().map(|path| KeyStore {
            path: path.clone(),
            password: self.key_store_password.clone(),
        })
    }

    fn trust_store(&self) -> Option<TrustStore> {
        self.trust_store_path.as_ref().map(|path| TrustStore {
            path: path.clone(),
            password: self.trust_store_password.clone(),
        })
    }
}

/// Create a TlsAcceptor (server-side) from the given configuration.
pub(crate) fn make_tls_acceptor(config: &ServerTlsConfig) -> Result<TlsAcceptor, TlsConfigError> {
    let provider = Arc::new(default_provider());
    let (certs, key) = config.key_store.load()?;
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;
    let builder = match (config.client_auth, &config.trust_store) {
        (ClientAuth::None, _) => builder.with_no_client_auth(),
        (_, None) => return Err(TlsConfigError::MissingTrustStore),
        (client_auth, Some(trust_store)) => {
            let roots = Arc::new(trust_store.load()?);
            let mut verifier = WebPkiClientVerifier::builder_with_provider(roots, provider);
            if client_auth == ClientAuth::Request {
                verifier = verifier.allow_unauthenticated();
            }
            builder.with_client_cert_verifier(verifier.build()?)
        }
    };
    let config = builder.with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Create a TlsConnector (client-side) from the given configuration.
pub(crate) fn make_tls_connector(config: &ClientTlsConfig) -> Result<TlsConnector, TlsConfigError> {
    let provider = Arc::new(default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;
    let builder = match &config.trust {
        PeerTrust::Store(trust_store) => builder.with_root_certificates(trust_store.load()?),
        PeerTrust::InsecureTrustAll => {
            log::warn!("TLS server certificates will not be verified (trust all)");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustAllVerifier::new(&provider)))
        }
    };
    let config = match &config.key_store {
        Some(key_store) => {
            let (certs, key) = key_store.load()?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let pem_error = |source| TlsConfigError::Pem {
        path: path.to_path_buf(),
        source,
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error)?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificate(path.to_path_buf()));
    }

    Ok(certs)
}

fn warn_if_password(path: &Path, password: &Option<String>) {
    if password.is_some() {
        log::warn!(
            "{}: PEM stores are not encrypted; ignoring password",
            path.display()
        );
    }
}

/// Accept any server certificate, but still check handshake
/// signatures.
#[derive(Debug)]
struct TrustAllVerifier {
    algos: WebPkiSupportedAlgorithms,
}

impl TrustAllVerifier {
    fn new(crypto: &Arc<CryptoProvider>) -> Self {
        Self {
            algos: crypto.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for TrustAllVerifier {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algos)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algos)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algos.supported_schemes()
    }
}
