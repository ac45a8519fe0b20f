use crate::tls::{ClientAuth, TlsSettings};

/// Default maximum number of bytes queued on a socket before
/// [crate::Socket::write_queue_full] reports true.
pub const DEFAULT_WRITE_QUEUE_MAX_SIZE: usize = 64 * 1024;

/// Default connect timeout, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 60_000;

/// Default size of the queue of pending connections.
pub const DEFAULT_ACCEPT_BACKLOG: u32 = 1024;

#[derive(Clone, serde::Deserialize, serde::Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Write queue size of sockets created in the context.
    #[serde(default = "default_write_queue_max_size")]
    pub write_queue_max_size: usize,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub connector: ConnectorConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl NetConfig {
    pub fn new() -> Self {
        NetConfig {
            write_queue_max_size: DEFAULT_WRITE_QUEUE_MAX_SIZE,
            listener: ListenerConfig::default(),
            connector: ConnectorConfig::default(),
        }
    }
}

/// Define a listener.
#[derive(Clone, serde::Deserialize, serde::Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Host name or IP address to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to; 0 picks any free port.
    #[serde(default)]
    pub port: u16,

    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: u32,

    #[serde(default = "default_true")]
    pub reuse_address: bool,

    #[serde(default = "default_true")]
    pub tcp_no_delay: bool,

    /// Whether to ask clients for a certificate. Anything but
    /// "none" requires a trust store.
    #[serde(default)]
    pub client_auth: ClientAuth,

    /// TLS material. With `enabled = true`, handshakes start as soon as
    /// a connection is accepted; otherwise, the key store is only used
    /// when a handler upgrades its socket.
    pub tls: Option<TlsSettings>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            host: default_host(),
            port: 0,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            reuse_address: true,
            tcp_no_delay: true,
            client_auth: ClientAuth::None,
            tls: None,
        }
    }
}

/// Define a connector.
#[derive(Clone, serde::Deserialize, serde::Serialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Maximum time, in milliseconds, a connection attempt can take,
    /// TLS handshake included.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub tcp_no_delay: bool,

    pub tls: Option<TlsSettings>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            tcp_no_delay: true,
            tls: None,
        }
    }
}

fn default_write_queue_max_size() -> usize {
    DEFAULT_WRITE_QUEUE_MAX_SIZE
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_accept_backlog() -> u32 {
    DEFAULT_ACCEPT_BACKLOG
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}
