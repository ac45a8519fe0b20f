use crate::NetContext;
use crate::config::ConnectorConfig;
use crate::context::IoScope;
use crate::error::{ConnectError, TlsConfigError, TlsError};
use crate::hostport::HostPort;
use crate::metrics;
use crate::socket::{Socket, SocketStream};
use crate::tls::{self, ClientTlsConfig};
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Opens outgoing connections.
///
/// Each call to [Connector::connect] is a single, independent attempt.
pub struct Connector {
    scope: IoScope,
    connect_timeout: Duration,
    tls: Option<TlsConnector>,
    tcp_no_delay: bool,
}

impl Connector {
    pub(crate) fn new(scope: IoScope, connect_timeout: Duration) -> Self {
        Self {
            scope,
            connect_timeout,
            tls: None,
            tcp_no_delay: true,
        }
    }

    /// Create a connector from the given config.
    pub fn from_config(ctx: &NetContext, config: &ConnectorConfig) -> Result<Self, TlsConfigError> {
        let mut connector = ctx.connector();
        connector
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .tcp_no_delay(config.tcp_no_delay);
        if let Some(settings) = &config.tls {
            if let Some(client_config) = settings.client_config()? {
                connector.tls(&client_config)?;
            }
        }

        Ok(connector)
    }

    /// Maximum time a connection attempt may take, name resolution
    /// and TLS handshake included.
    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;

        self
    }

    /// Run a TLS handshake, as client, on every new connection.
    pub fn tls(&mut self, config: &ClientTlsConfig) -> Result<&mut Self, TlsConfigError> {
        self.tls = Some(tls::make_tls_connector(config)?);

        Ok(self)
    }

    /// Go back to plaintext connections.
    pub fn no_tls(&mut self) -> &mut Self {
        self.tls = None;

        self
    }

    pub fn tcp_no_delay(&mut self, tcp_no_delay: bool) -> &mut Self {
        self.tcp_no_delay = tcp_no_delay;

        self
    }

    /// True if connections are upgraded to TLS.
    pub fn is_ssl(&self) -> bool {
        self.tls.is_some()
    }

    /// Connect to the given host and port.
    pub async fn connect(&self, port: u16, host: &str) -> Result<Socket, ConnectError> {
        if self.scope.is_shut_down() {
            return Err(ConnectError::ShutDown);
        }
        let res = tokio::select! {
            _ = self.scope.token().cancelled() => Err(ConnectError::ShutDown),
            res = self.attempt(port, host) => res,
        };
        metrics::METRIC_CONNECT_COUNT
            .with_label_values(&[metrics::result_label(&res)])
            .inc();
        match &res {
            Ok(socket) => log::debug!("@{} Connected", socket.remote_address()),
            Err(err) => log::debug!("Connection to {host}:{port} failed: {err}"),
        }

        res
    }

    async fn attempt(&self, port: u16, host: &str) -> Result<Socket, ConnectError> {
        with_connect_timeout(target(host, port), self.connect_timeout, async {
            let hostport = HostPort::resolve(host, port).await?;

            self.establish(&hostport).await
        })
        .await
    }

    async fn establish(&self, hostport: &HostPort) -> Result<Socket, ConnectError> {
        let (tcp, addr) = connect_any(hostport).await?;
        let io_error = |source| ConnectError::Io { addr, source };
        tcp.set_nodelay(self.tcp_no_delay).map_err(io_error)?;
        let local = tcp.local_addr().map_err(io_error)?.into();
        let remote = tcp.peer_addr().map_err(io_error)?.into();

        let stream = match &self.tls {
            None => SocketStream::Plain(tcp),
            Some(connector) => {
                let res = connector
                    .connect(server_name(hostport)?, tcp)
                    .await
                    .map_err(TlsError::Handshake);
                metrics::METRIC_TLS_HANDSHAKE_COUNT
                    .with_label_values(&["client", metrics::result_label(&res)])
                    .inc();
                SocketStream::ClientTls(Box::new(res?))
            }
        };

        Ok(Socket::new(stream, local, remote, None, self.scope.clone()))
    }
}

/// Connect to the first address of the host that accepts.
///
/// Fails with the error of the last address tried.
async fn connect_any(hostport: &HostPort) -> Result<(TcpStream, SocketAddr), ConnectError> {
    let mut last_err = None;
    for addr in hostport.addrs() {
        match TcpStream::connect(addr).await {
            Ok(tcp) => return Ok((tcp, addr)),
            Err(source) => {
                log::debug!("{hostport}: cannot connect to {addr}: {source}");
                last_err = Some(ConnectError::Io { addr, source });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ConnectError::Io {
        addr: hostport.addr(),
        source: io::Error::new(io::ErrorKind::NotFound, "no address to connect to"),
    }))
}

fn target(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn server_name(hostport: &HostPort) -> Result<ServerName<'static>, ConnectError> {
    ServerName::try_from(hostport.host().to_string())
        .map_err(|_| ConnectError::InvalidServerName(hostport.host().to_string()))
}

async fn with_connect_timeout<T>(
    target: String,
    timeout: Duration,
    fut: impl Future<Output = Result<T, ConnectError>>,
) -> Result<T, ConnectError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ConnectError::Timeout { target, timeout })?
}
