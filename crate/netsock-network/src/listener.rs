use crate::NetContext;
use crate::config::{DEFAULT_ACCEPT_BACKLOG, ListenerConfig};
use crate::context::IoScope;
use crate::error::{BindError, TlsConfigError};
use crate::hostport::HostPort;
use crate::metrics;
use crate::socket::{Socket, SocketStream};
use crate::tls::{self, ServerTlsConfig};
use futures::FutureExt as _;
use futures::future::BoxFuture;
use netsock_types::AddressInfo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsAcceptor;

/// How long to wait before accepting again after an accept error,
/// such as running out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type ConnectHandler = Arc<dyn Fn(Socket) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Accepts incoming connections and passes them to a handler.
///
/// A listener listens at most once. Calling [Listener::close] or
/// dropping the listener stops accepting and closes every connection
/// it accepted.
pub struct Listener {
    scope: IoScope,
    handler: Option<ConnectHandler>,
    acceptor: Option<TlsAcceptor>,
    ssl_on_accept: bool,
    accept_backlog: u32,
    reuse_address: bool,
    tcp_no_delay: bool,
    listening: AtomicBool,
    local: OnceLock<AddressInfo>,
}

impl Listener {
    pub(crate) fn new(scope: IoScope) -> Self {
        Self {
            scope,
            handler: None,
            acceptor: None,
            ssl_on_accept: false,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            reuse_address: true,
            tcp_no_delay: true,
            listening: AtomicBool::new(false),
            local: OnceLock::new(),
        }
    }

    /// Create a listener from the given config.
    ///
    /// The host and port of the config are for the caller to pass to
    /// [Listener::listen].
    pub fn from_config(ctx: &NetContext, config: &ListenerConfig) -> Result<Self, TlsConfigError> {
        let mut listener = ctx.listener();
        listener
            .accept_backlog(config.accept_backlog)
            .reuse_address(config.reuse_address)
            .tcp_no_delay(config.tcp_no_delay);
        if let Some(settings) = &config.tls {
            let server_config = settings.server_config(config.client_auth)?;
            listener.tls(&server_config)?.ssl(settings.enabled);
        }

        Ok(listener)
    }

    /// Register the handler called for each accepted connection.
    ///
    /// Each call runs in its own task. Errors returned by the handler
    /// are logged.
    pub fn connect_handler<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Socket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |socket: Socket| handler(socket).boxed()));

        self
    }

    /// Make TLS available on accepted sockets.
    ///
    /// Sockets must still be upgraded by the handler with
    /// [Socket::ssl], unless [Listener::ssl] is set.
    pub fn tls(&mut self, config: &ServerTlsConfig) -> Result<&mut Self, TlsConfigError> {
        self.acceptor = Some(tls::make_tls_acceptor(config)?);

        Ok(self)
    }

    /// If true, run the TLS handshake on accept, before calling the
    /// handler.
    pub fn ssl(&mut self, ssl_on_accept: bool) -> &mut Self {
        self.ssl_on_accept = ssl_on_accept;

        self
    }

    pub fn accept_backlog(&mut self, backlog: u32) -> &mut Self {
        self.accept_backlog = backlog;

        self
    }

    pub fn reuse_address(&mut self, reuse_address: bool) -> &mut Self {
        self.reuse_address = reuse_address;

        self
    }

    pub fn tcp_no_delay(&mut self, tcp_no_delay: bool) -> &mut Self {
        self.tcp_no_delay = tcp_no_delay;

        self
    }

    /// Address the listener is bound to, once listening.
    pub fn local_address(&self) -> Option<AddressInfo> {
        self.local.get().copied()
    }

    /// Bind to the given host and port and start accepting connections
    /// in the background.
    ///
    /// Port 0 binds any free port. Returns the address actually bound.
    pub async fn listen(&self, port: u16, host: &str) -> Result<AddressInfo, BindError> {
        if self.scope.is_shut_down() {
            return Err(BindError::ShutDown);
        }
        let handler = self.handler.clone().ok_or(BindError::NoConnectHandler)?;
        if self.ssl_on_accept && self.acceptor.is_none() {
            return Err(BindError::TlsNotConfigured);
        }
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(BindError::AlreadyListening);
        }

        let listener = match self.bind(port, host).await {
            Ok(listener) => listener,
            Err(err) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let local = match listener.local_addr() {
            Ok(addr) => AddressInfo::from(addr),
            Err(source) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(BindError::Io {
                    addr: HostPort::localhost(port).addr(),
                    source,
                });
            }
        };
        let _ = self.local.set(local);
        log::info!("Listening on {local}");

        let accepter = Arc::new(Accepter {
            handler,
            acceptor: self.acceptor.clone(),
            ssl_on_accept: self.ssl_on_accept,
            tcp_no_delay: self.tcp_no_delay,
            scope: self.scope.clone(),
        });
        self.scope.spawn(accept_loop(listener, local, accepter));

        Ok(local)
    }

    /// Stop accepting connections, close the connections accepted so
    /// far and wait for their tasks to finish.
    pub async fn close(&self) {
        self.scope.shutdown().await;
    }

    async fn bind(&self, port: u16, host: &str) -> Result<TcpListener, BindError> {
        let addr = HostPort::resolve(host, port).await?.addr();
        let io_error = |source| BindError::Io { addr, source };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(io_error)?;
        socket.set_reuseaddr(self.reuse_address).map_err(io_error)?;
        socket.bind(addr).map_err(io_error)?;

        socket.listen(self.accept_backlog).map_err(io_error)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.scope.token().cancel();
    }
}

async fn accept_loop(listener: TcpListener, local: AddressInfo, accepter: Arc<Accepter>) {
    let token = accepter.scope.token().clone();
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Stopped listening on {local}");
                return;
            }
            res = listener.accept() => match res {
                Ok((stream, peer)) => accepter.accept(stream, peer),
                Err(err) => {
                    log::debug!("Accept failed on {local}: {err}");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// What the accept loop needs to hand connections over.
struct Accepter {
    handler: ConnectHandler,
    acceptor: Option<TlsAcceptor>,
    ssl_on_accept: bool,
    tcp_no_delay: bool,
    scope: IoScope,
}

impl Accepter {
    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        metrics::METRIC_ACCEPTED_CONNECTION_COUNT.inc();
        let this = Arc::clone(self);
        self.scope.spawn(async move {
            let token = this.scope.token().clone();
            tokio::select! {
                _ = token.cancelled() => {}
                _ = this.serve(stream, peer) => {}
            }
        });
    }

    async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let socket = match self.prepare(stream).await {
            Ok(socket) => socket,
            Err(err) => {
                log::debug!("@{peer} Connection rejected: {err:#}");
                return;
            }
        };
        log::debug!("@{peer} Accepted connection");
        if let Err(err) = (self.handler)(socket).await {
            log::debug!("@{peer} Connection handler failed: {err:#}");
        }
    }

    async fn prepare(&self, stream: TcpStream) -> anyhow::Result<Socket> {
        stream.set_nodelay(self.tcp_no_delay)?;
        let local = stream.local_addr()?.into();
        let remote = stream.peer_addr()?.into();
        let mut socket = Socket::new(
            SocketStream::Plain(stream),
            local,
            remote,
            self.acceptor.clone(),
            self.scope.clone(),
        );
        if self.ssl_on_accept {
            socket.ssl().await?;
        }

        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::io::AsyncReadExt as _;

    fn echo_listener(ctx: &NetContext) -> Listener {
        let mut listener = ctx.listener();
        listener.connect_handler(|mut socket: Socket| async move {
            while let Some(chunk) = socket.read_chunk().await? {
                socket.write(chunk)?;
            }
            socket.close().await?;

            Ok::<(), anyhow::Error>(())
        });

        listener
    }

    #[tokio::test]
    async fn listen_on_free_port() -> anyhow::Result<()> {
        let _ = env_logger::try_init();
        let ctx = NetContext::new();
        let listener = echo_listener(&ctx);
        assert_eq!(None, listener.local_address());

        let addr = listener.listen(0, "127.0.0.1").await?;
        assert_ne!(0, addr.port());
        assert!(addr.is_loopback());
        assert_eq!(Some(addr), listener.local_address());

        TcpStream::connect(addr.to_socket_addr()).await?;

        Ok(())
    }

    #[tokio::test]
    async fn listen_twice() -> anyhow::Result<()> {
        let ctx = NetContext::new();
        let listener = echo_listener(&ctx);

        let addr = listener.listen(0, "127.0.0.1").await?;
        assert!(matches!(
            listener.listen(0, "127.0.0.1").await,
            Err(BindError::AlreadyListening)
        ));
        assert_eq!(Some(addr), listener.local_address());

        Ok(())
    }

    #[tokio::test]
    async fn listen_without_handler() -> anyhow::Result<()> {
        let ctx = NetContext::new();
        let listener = ctx.listener();

        assert!(matches!(
            listener.listen(0, "127.0.0.1").await,
            Err(BindError::NoConnectHandler)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn ssl_on_accept_without_tls() -> anyhow::Result<()> {
        let ctx = NetContext::new();
        let mut listener = echo_listener(&ctx);
        listener.ssl(true);

        assert!(matches!(
            listener.listen(0, "127.0.0.1").await,
            Err(BindError::TlsNotConfigured)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn address_in_use() -> anyhow::Result<()> {
        let ctx = NetContext::new();
        let first = echo_listener(&ctx);
        let addr = first.listen(0, "127.0.0.1").await?;

        let second = echo_listener(&ctx);
        match second.listen(addr.port(), "127.0.0.1").await {
            Err(BindError::Io { source, .. }) => {
                assert_eq!(io::ErrorKind::AddrInUse, source.kind())
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // A failed listen can be retried.
        second.listen(0, "127.0.0.1").await?;

        Ok(())
    }

    #[tokio::test]
    async fn unresolvable_host() -> anyhow::Result<()> {
        let ctx = NetContext::new();
        let listener = echo_listener(&ctx);

        assert!(matches!(
            listener.listen(0, "invalid.invalid").await,
            Err(BindError::Resolve(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn handler_errors_are_not_fatal() -> anyhow::Result<()> {
        let _ = env_logger::try_init();
        let ctx = NetContext::new();
        let mut listener = ctx.listener();
        listener.connect_handler(|_| async { Err::<(), _>(anyhow::anyhow!("go away")) });
        let addr = listener.listen(0, "127.0.0.1").await?;

        for _ in 0..2 {
            let mut stream = TcpStream::connect(addr.to_socket_addr()).await?;
            let mut buf = vec![];
            assert_eq!(0, stream.read_to_end(&mut buf).await?);
        }

        Ok(())
    }

    #[tokio::test]
    async fn close_refuses_connections() -> anyhow::Result<()> {
        let ctx = NetContext::new();
        let listener = echo_listener(&ctx);
        let addr = listener.listen(0, "127.0.0.1").await?;

        listener.close().await;

        let ret = TcpStream::connect(addr.to_socket_addr()).await;
        assert_eq!(
            Some(io::ErrorKind::ConnectionRefused),
            ret.err().map(|err| err.kind())
        );
        assert!(matches!(
            listener.listen(0, "127.0.0.1").await,
            Err(BindError::ShutDown)
        ));
        // The context is still usable.
        assert!(!ctx.is_shut_down());

        Ok(())
    }

    #[tokio::test]
    async fn context_shutdown_closes_listener() -> anyhow::Result<()> {
        let ctx = NetContext::new();
        let listener = echo_listener(&ctx);
        let addr = listener.listen(0, "127.0.0.1").await?;

        ctx.shutdown().await;

        assert!(TcpStream::connect(addr.to_socket_addr()).await.is_err());
        assert!(matches!(
            listener.listen(0, "127.0.0.1").await,
            Err(BindError::ShutDown)
        ));

        Ok(())
    }
}
