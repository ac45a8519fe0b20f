use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Host name resolution failed.
#[derive(Debug, thiserror::Error)]
#[error("cannot resolve {host}: {source}")]
pub struct ResolveError {
    pub host: String,
    #[source]
    pub source: io::Error,
}

/// Errors returned by [crate::Listener::listen].
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("listener is already listening")]
    AlreadyListening,

    #[error("no connect handler registered")]
    NoConnectHandler,

    #[error("listener is shut down")]
    ShutDown,

    #[error("TLS on accept requires a TLS configuration")]
    TlsNotConfigured,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("cannot bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Errors returned by [crate::Connector::connect].
///
/// A connector never retries; each error corresponds to exactly one
/// failed attempt.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("network context is shut down")]
    ShutDown,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The whole attempt, name resolution included, took longer than
    /// the connect timeout. `target` is host and port, as given.
    #[error("connection to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("cannot connect to {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS server name '{0}'")]
    InvalidServerName(String),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl ConnectError {
    /// Kind of the underlying I/O error, if any.
    pub fn io_error_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ConnectError::Io { source, .. } => Some(source.kind()),
            ConnectError::Resolve(err) => Some(err.source.kind()),
            ConnectError::Tls(TlsError::Handshake(err)) => Some(err.kind()),
            _ => None,
        }
    }
}

/// TLS failures on an established connection.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("no TLS configuration available for this socket")]
    NotConfigured,

    #[error("TLS is already active on this socket")]
    AlreadyActive,

    #[error("TLS upgrade must happen before any data is exchanged")]
    DataExchanged,

    #[error("socket is closed")]
    Closed,

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

/// Invalid TLS key store, trust store or settings.
#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("{}: cannot read PEM file: {source}", .path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: rustls::pki_types::pem::Error,
    },

    #[error("{}: no certificate found", .0.display())]
    NoCertificate(PathBuf),

    #[error("a trust store is required unless trust_all is set")]
    MissingTrustStore,

    #[error("a key store is required for server TLS")]
    MissingKeyStore,

    #[error("invalid client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Failures of [crate::Socket::send_file].
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("{}: cannot open file: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: not a regular file", .path.display())]
    NotAFile { path: PathBuf },

    #[error("{}: transmission failed: {source}", .path.display())]
    Transmit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: socket closed before the file was sent", .path.display())]
    Interrupted { path: PathBuf },
}

/// Errors reading from or writing to a [crate::Socket].
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Tls(#[from] TlsError),
}
