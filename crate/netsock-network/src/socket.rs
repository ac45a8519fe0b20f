use crate::context::IoScope;
use crate::error::{FileError, SocketError, TlsError};
use crate::metrics;
use bytes::{Bytes, BytesMut};
use netsock_types::AddressInfo;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::io::{
    AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// A TCP stream, with or without TLS.
pub(crate) enum SocketStream {
    Plain(TcpStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl SocketStream {
    fn is_tls(&self) -> bool {
        !matches!(self, SocketStream::Plain(_))
    }
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            SocketStream::ServerTls(s) => Pin::new(s).poll_read(cx, buf),
            SocketStream::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            SocketStream::ServerTls(s) => Pin::new(s).poll_write(cx, buf),
            SocketStream::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_flush(cx),
            SocketStream::ServerTls(s) => Pin::new(s).poll_flush(cx),
            SocketStream::ClientTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            SocketStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            SocketStream::ServerTls(s) => Pin::new(s).poll_shutdown(cx),
            SocketStream::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// An established connection.
///
/// Data written to a socket is queued and transmitted in order by a
/// background task; [Socket::write] never blocks. Files sent with
/// [Socket::send_file] take their place in the same queue.
///
/// The background tasks start on the first read or write. Until then,
/// a socket accepted by a [crate::Listener] configured with TLS can
/// still be upgraded with [Socket::ssl].
pub struct Socket {
    local: AddressInfo,
    remote: AddressInfo,
    tls_active: bool,
    acceptor: Option<TlsAcceptor>,
    scope: IoScope,
    write_queue_max_size: usize,
    state: State,
}

enum State {
    Idle(SocketStream),
    Running {
        reader: SocketReader,
        writer: SocketWriter,
    },
    Closed,
}

impl Socket {
    pub(crate) fn new(
        stream: SocketStream,
        local: AddressInfo,
        remote: AddressInfo,
        acceptor: Option<TlsAcceptor>,
        scope: IoScope,
    ) -> Self {
        Self {
            local,
            remote,
            tls_active: stream.is_tls(),
            acceptor,
            write_queue_max_size: scope.write_queue_max_size(),
            scope,
            state: State::Idle(stream),
        }
    }

    /// Address of this end of the connection.
    pub fn local_address(&self) -> AddressInfo {
        self.local
    }

    /// Address of the peer.
    pub fn remote_address(&self) -> AddressInfo {
        self.remote
    }

    /// True once TLS is active on this socket.
    pub fn is_ssl(&self) -> bool {
        self.tls_active
    }

    /// True once [Socket::close] was called or the socket was split.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Upgrade an accepted socket to TLS, playing the server role.
    ///
    /// This must be called before any data is read or written.
    pub async fn ssl(&mut self) -> Result<(), TlsError> {
        if self.tls_active {
            return Err(TlsError::AlreadyActive);
        }
        let acceptor = self.acceptor.clone().ok_or(TlsError::NotConfigured)?;
        let tcp = match std::mem::replace(&mut self.state, State::Closed) {
            State::Idle(SocketStream::Plain(tcp)) => tcp,
            State::Closed => return Err(TlsError::Closed),
            state @ State::Idle(_) => {
                self.state = state;
                return Err(TlsError::AlreadyActive);
            }
            state @ State::Running { .. } => {
                self.state = state;
                return Err(TlsError::DataExchanged);
            }
        };

        let res = tokio::select! {
            _ = self.scope.token().cancelled() => Err(TlsError::Closed),
            res = acceptor.accept(tcp) => res.map_err(TlsError::Handshake),
        };
        metrics::METRIC_TLS_HANDSHAKE_COUNT
            .with_label_values(&["server", metrics::result_label(&res)])
            .inc();
        let tls = res?;
        log::debug!("@{} TLS active", self.remote);
        self.state = State::Idle(SocketStream::ServerTls(Box::new(tls)));
        self.tls_active = true;

        Ok(())
    }

    /// Read the next chunk of data sent by the peer.
    ///
    /// Returns `None` once the peer has closed its side of the
    /// connection or the socket has been shut down.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, SocketError> {
        let (reader, _) = self.running()?;

        reader.read_chunk().await
    }

    /// Queue data for writing.
    pub fn write(&mut self, data: impl Into<Bytes>) -> Result<(), SocketError> {
        let (_, writer) = self.running()?;

        writer.write(data)
    }

    /// Queue the content of a file for writing.
    ///
    /// The returned future resolves once the whole file has been
    /// written, with the number of bytes sent. Data written after this
    /// call is sent after the file.
    pub fn send_file(&mut self, path: impl AsRef<Path>) -> SendFile {
        match self.running() {
            Ok((_, writer)) => writer.send_file(path),
            Err(_) => SendFile::interrupted(path.as_ref().to_path_buf()),
        }
    }

    /// Queue the content of a file for writing, without waiting for
    /// the result. Failures are logged.
    pub fn send_file_detached(&mut self, path: impl AsRef<Path>) {
        let remote = self.remote;
        match self.running() {
            Ok((_, writer)) => writer.send_file_detached(path),
            Err(_) => log::warn!(
                "@{remote} Cannot send {}: socket is closed",
                path.as_ref().display()
            ),
        }
    }

    /// A handle for writing to this socket from other tasks.
    pub fn writer(&mut self) -> Result<SocketWriter, SocketError> {
        let (_, writer) = self.running()?;

        Ok(writer.clone())
    }

    /// Split this socket into independent read and write sides.
    pub fn into_split(mut self) -> Result<(SocketReader, SocketWriter), SocketError> {
        self.running()?;
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Running { reader, writer } => Ok((reader, writer)),
            _ => Err(SocketError::Closed),
        }
    }

    /// Set the number of queued bytes above which
    /// [Socket::write_queue_full] reports true.
    pub fn set_write_queue_max_size(&mut self, max_size: usize) {
        self.write_queue_max_size = max_size;
        if let State::Running { writer, .. } = &self.state {
            writer.queue.set_max_size(max_size);
        }
    }

    /// True if more data is queued than the write queue max size.
    ///
    /// Writes are still accepted when the queue is full; callers that
    /// care should wait for [Socket::drained] before writing more.
    pub fn write_queue_full(&self) -> bool {
        match &self.state {
            State::Running { writer, .. } => writer.write_queue_full(),
            _ => false,
        }
    }

    /// Wait until the write queue is at most half full.
    pub async fn drained(&self) {
        if let State::Running { writer, .. } = &self.state {
            writer.drained().await;
        }
    }

    /// Flush queued data and close the connection.
    pub async fn close(&mut self) -> Result<(), SocketError> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Idle(mut stream) => {
                stream.shutdown().await?;
                Ok(())
            }
            State::Running { writer, .. } => writer.close().await,
            State::Closed => Ok(()),
        }
    }

    fn running(&mut self) -> Result<(&mut SocketReader, &SocketWriter), SocketError> {
        self.state = match std::mem::replace(&mut self.state, State::Closed) {
            State::Idle(stream) => {
                let (reader, writer) =
                    start(stream, self.remote, &self.scope, self.write_queue_max_size);
                State::Running { reader, writer }
            }
            state => state,
        };
        match &mut self.state {
            State::Running { reader, writer } => Ok((reader, &*writer)),
            _ => Err(SocketError::Closed),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("tls", &self.tls_active)
            .finish()
    }
}

/// Read side of a [Socket].
pub struct SocketReader {
    half: ReadHalf<SocketStream>,
    buf: BytesMut,
    token: CancellationToken,
    remote: AddressInfo,
    eof: bool,
}

impl SocketReader {
    /// Read the next chunk of data; see [Socket::read_chunk].
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, SocketError> {
        if self.eof {
            return Ok(None);
        }
        self.buf.reserve(READ_CHUNK_SIZE);
        let n = tokio::select! {
            biased;
            _ = self.token.cancelled() => 0,
            res = self.half.read_buf(&mut self.buf) => res?,
        };
        if n == 0 {
            log::debug!("@{} Connection closed", self.remote);
            self.eof = true;
            return Ok(None);
        }
        metrics::METRIC_BYTES_READ.inc_by(n as u64);

        Ok(Some(self.buf.split().freeze()))
    }

    pub fn remote_address(&self) -> AddressInfo {
        self.remote
    }
}

enum WriteOp {
    Data(Bytes),
    File {
        path: PathBuf,
        done: Option<oneshot::Sender<Result<u64, FileError>>>,
    },
    Close(oneshot::Sender<io::Result<()>>),
}

/// Write side of a [Socket].
///
/// Writers can be cloned and shared between tasks; everything they
/// queue goes through the same ordered queue.
#[derive(Clone)]
pub struct SocketWriter {
    tx: mpsc::UnboundedSender<WriteOp>,
    queue: Arc<WriteQueue>,
    remote: AddressInfo,
}

impl SocketWriter {
    /// Queue data for writing; see [Socket::write].
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), SocketError> {
        let data = data.into();
        let len = data.len();
        self.queue.add(len);
        self.tx.send(WriteOp::Data(data)).map_err(|_| {
            self.queue.release(len);
            SocketError::Closed
        })
    }

    /// Queue a file for writing; see [Socket::send_file].
    pub fn send_file(&self, path: impl AsRef<Path>) -> SendFile {
        let path = path.as_ref().to_path_buf();
        let (done_tx, done_rx) = oneshot::channel();

        // If the writer task is gone, done_tx is dropped here and the
        // future reports an interruption.
        let _ = self.tx.send(WriteOp::File {
            path: path.clone(),
            done: Some(done_tx),
        });

        SendFile {
            path,
            rx: done_rx,
        }
    }

    /// Queue a file for writing; see [Socket::send_file_detached].
    pub fn send_file_detached(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        if let Err(mpsc::error::SendError(WriteOp::File { path, .. })) =
            self.tx.send(WriteOp::File { path, done: None })
        {
            log::warn!(
                "@{} Cannot send {}: socket is closed",
                self.remote,
                path.display()
            );
        }
    }

    pub fn write_queue_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Wait until the write queue is at most half full, or the
    /// socket is closed.
    pub async fn drained(&self) {
        self.queue.drained().await
    }

    /// True once the writer task is gone and nothing more can be
    /// written.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Flush everything queued so far and close the connection.
    ///
    /// The peer sees the end of the stream after the last byte queued
    /// before this call.
    pub async fn close(&self) -> Result<(), SocketError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WriteOp::Close(tx))
            .map_err(|_| SocketError::Closed)?;
        rx.await.map_err(|_| SocketError::Closed)??;

        Ok(())
    }

    pub fn remote_address(&self) -> AddressInfo {
        self.remote
    }
}

/// Completion of a file transmission started by [Socket::send_file].
///
/// Resolves to the number of bytes sent. Dropping the future doesn't
/// cancel the transmission; failures are then logged instead.
#[must_use = "use send_file_detached for fire-and-forget transmissions"]
pub struct SendFile {
    path: PathBuf,
    rx: oneshot::Receiver<Result<u64, FileError>>,
}

impl SendFile {
    fn interrupted(path: PathBuf) -> Self {
        let (_, rx) = oneshot::channel();

        Self { path, rx }
    }
}

impl Future for SendFile {
    type Output = Result<u64, FileError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(res)) => Poll::Ready(res),
            Poll::Ready(Err(_)) => Poll::Ready(Err(FileError::Interrupted {
                path: self.path.clone(),
            })),
        }
    }
}

/// Accounting of the bytes waiting in a socket's write queue.
struct WriteQueue {
    queued: AtomicUsize,
    max_size: AtomicUsize,
    closed: AtomicBool,
    notify: Notify,
}

impl WriteQueue {
    fn new(max_size: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            max_size: AtomicUsize::new(max_size.max(1)),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn add(&self, len: usize) {
        self.queued.fetch_add(len, Ordering::AcqRel);
    }

    fn release(&self, len: usize) {
        let before = self.queued.fetch_sub(len, Ordering::AcqRel);
        if before - len <= self.low_water_mark() {
            self.notify.notify_waiters();
        }
    }

    fn set_max_size(&self, max_size: usize) {
        self.max_size.store(max_size.max(1), Ordering::Release);
        self.notify.notify_waiters();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    fn is_full(&self) -> bool {
        self.queued.load(Ordering::Acquire) >= self.max_size.load(Ordering::Acquire)
    }

    fn low_water_mark(&self) -> usize {
        self.max_size.load(Ordering::Acquire) / 2
    }

    fn is_drained(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self.queued.load(Ordering::Acquire) <= self.low_water_mark()
    }

    async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_drained() {
                return;
            }
            notified.await;
        }
    }
}

/// Marks the queue closed when the writer task exits, however it
/// exits.
struct CloseOnExit(Arc<WriteQueue>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn start(
    stream: SocketStream,
    remote: AddressInfo,
    scope: &IoScope,
    write_queue_max_size: usize,
) -> (SocketReader, SocketWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = Arc::new(WriteQueue::new(write_queue_max_size));
    scope.spawn(drive_writes(
        write_half,
        rx,
        Arc::clone(&queue),
        scope.token().clone(),
        remote,
    ));

    (
        SocketReader {
            half: read_half,
            buf: BytesMut::new(),
            token: scope.token().clone(),
            remote,
            eof: false,
        },
        SocketWriter { tx, queue, remote },
    )
}

async fn drive_writes(
    mut out: WriteHalf<SocketStream>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    queue: Arc<WriteQueue>,
    token: CancellationToken,
    remote: AddressInfo,
) {
    let _closed = CloseOnExit(Arc::clone(&queue));
    loop {
        let op = tokio::select! {
            _ = token.cancelled() => {
                log::debug!("@{remote} Socket shut down");
                return;
            }
            op = rx.recv() => op,
        };
        let Some(op) = op else {
            // Every writer is gone.
            break;
        };
        let flow = tokio::select! {
            _ = token.cancelled() => {
                log::debug!("@{remote} Socket shut down while writing");
                return;
            }
            flow = apply(&mut out, op, &queue, remote) => flow,
        };
        if flow.is_break() {
            return;
        }
    }
    if let Err(err) = out.shutdown().await {
        log::debug!("@{remote} Shutdown failed: {err}");
    }
}

async fn apply(
    out: &mut WriteHalf<SocketStream>,
    op: WriteOp,
    queue: &WriteQueue,
    remote: AddressInfo,
) -> ControlFlow<()> {
    match op {
        WriteOp::Data(data) => {
            let res = write_data(out, &data).await;
            queue.release(data.len());
            if let Err(err) = res {
                log::debug!("@{remote} Write failed: {err}");
                return ControlFlow::Break(());
            }
        }
        WriteOp::File { path, done } => {
            let res = transmit_file(out, &path).await;
            metrics::METRIC_SENT_FILE_COUNT
                .with_label_values(&[metrics::result_label(&res)])
                .inc();
            let broken = matches!(res, Err(FileError::Transmit { .. }));
            report_file_result(remote, done, res);
            if broken {
                return ControlFlow::Break(());
            }
        }
        WriteOp::Close(done) => {
            let _ = done.send(out.shutdown().await);
            return ControlFlow::Break(());
        }
    }

    ControlFlow::Continue(())
}

async fn write_data<W>(out: &mut W, data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    out.write_all(data).await?;
    out.flush().await?;
    metrics::METRIC_BYTES_WRITTEN.inc_by(data.len() as u64);

    Ok(())
}

async fn transmit_file<W>(out: &mut W, path: &Path) -> Result<u64, FileError>
where
    W: AsyncWrite + Unpin,
{
    let open_error = |source| FileError::Open {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::File::open(path).await.map_err(open_error)?;
    let metadata = file.metadata().await.map_err(open_error)?;
    if !metadata.is_file() {
        return Err(FileError::NotAFile {
            path: path.to_path_buf(),
        });
    }

    let transmit_error = |source| FileError::Transmit {
        path: path.to_path_buf(),
        source,
    };
    let sent = tokio::io::copy(&mut file, out)
        .await
        .map_err(transmit_error)?;
    out.flush().await.map_err(transmit_error)?;
    metrics::METRIC_BYTES_WRITTEN.inc_by(sent);

    Ok(sent)
}

fn report_file_result(
    remote: AddressInfo,
    done: Option<oneshot::Sender<Result<u64, FileError>>>,
    res: Result<u64, FileError>,
) {
    let res = match done {
        Some(done) => match done.send(res) {
            Ok(()) => return,
            // Nobody is waiting for the result anymore.
            Err(res) => res,
        },
        None => res,
    };
    match res {
        Ok(sent) => log::debug!("@{remote} Sent {sent} bytes from file"),
        Err(err) => log::warn!("@{remote} {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_WRITE_QUEUE_MAX_SIZE;
    use crate::testing::{self, TestCerts};
    use crate::tls::{self, ServerTlsConfig};
    use assert_fs::TempDir;
    use assert_fs::prelude::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Fixture {
        tempdir: TempDir,
        scope: IoScope,
    }

    impl Fixture {
        fn setup() -> anyhow::Result<Self> {
            let _ = env_logger::try_init();

            Ok(Self {
                tempdir: TempDir::new()?,
                scope: IoScope::new(DEFAULT_WRITE_QUEUE_MAX_SIZE),
            })
        }

        async fn socket_pair(&self) -> anyhow::Result<(Socket, Socket)> {
            self.socket_pair_with_acceptor(None).await
        }

        async fn socket_pair_with_acceptor(
            &self,
            acceptor: Option<TlsAcceptor>,
        ) -> anyhow::Result<(Socket, Socket)> {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let client = TcpStream::connect(listener.local_addr()?).await?;
            let (server, _) = listener.accept().await?;

            Ok((
                self.wrap(server, acceptor)?,
                self.wrap(client, None)?,
            ))
        }

        fn wrap(&self, tcp: TcpStream, acceptor: Option<TlsAcceptor>) -> anyhow::Result<Socket> {
            let local = tcp.local_addr()?.into();
            let remote = tcp.peer_addr()?.into();

            Ok(Socket::new(
                SocketStream::Plain(tcp),
                local,
                remote,
                acceptor,
                self.scope.clone(),
            ))
        }
    }

    async fn read_to_end(socket: &mut Socket) -> anyhow::Result<Vec<u8>> {
        let mut content = vec![];
        while let Some(chunk) = socket.read_chunk().await? {
            content.extend_from_slice(&chunk);
        }

        Ok(content)
    }

    async fn read_exactly(socket: &mut Socket, len: usize) -> anyhow::Result<Vec<u8>> {
        let mut content = vec![];
        while content.len() < len {
            match socket.read_chunk().await? {
                Some(chunk) => content.extend_from_slice(&chunk),
                None => break,
            }
        }

        Ok(content)
    }

    #[tokio::test]
    async fn addresses() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (server, client) = fixture.socket_pair().await?;

        assert_eq!(server.local_address(), client.remote_address());
        assert_eq!(server.remote_address(), client.local_address());
        assert!(!server.is_ssl());
        assert!(!client.is_ssl());

        Ok(())
    }

    #[tokio::test]
    async fn write_then_read() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (mut server, mut client) = fixture.socket_pair().await?;

        client.write("hello")?;
        client.write(b" world".to_vec())?;
        client.write(Bytes::new())?;
        client.close().await?;

        assert_eq!(b"hello world".to_vec(), read_to_end(&mut server).await?);

        Ok(())
    }

    #[tokio::test]
    async fn write_after_close() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (mut server, mut client) = fixture.socket_pair().await?;

        server.write("bye")?;
        server.close().await?;
        assert!(server.is_closed());
        assert!(matches!(server.write("again"), Err(SocketError::Closed)));
        assert!(matches!(
            server.read_chunk().await,
            Err(SocketError::Closed)
        ));

        // Closing twice is fine.
        server.close().await?;

        assert_eq!(b"bye".to_vec(), read_to_end(&mut client).await?);
        assert_eq!(None, client.read_chunk().await?);

        Ok(())
    }

    #[tokio::test]
    async fn close_idle_socket() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (mut server, mut client) = fixture.socket_pair().await?;

        server.close().await?;
        assert_eq!(None, client.read_chunk().await?);

        Ok(())
    }

    #[tokio::test]
    async fn send_file_in_order() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let file = fixture.tempdir.child("test-send-file.html");
        testing::write_scratch_file(file.path(), b"Some data to write to the file")?;
        let (mut server, mut client) = fixture.socket_pair().await?;

        server.write("head:")?;
        let sent = server.send_file(file.path());
        server.write(":tail")?;
        assert_eq!(30, sent.await?);
        server.close().await?;

        assert_eq!(
            b"head:Some data to write to the file:tail".to_vec(),
            read_to_end(&mut client).await?
        );

        Ok(())
    }

    #[tokio::test]
    async fn send_file_detached() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let file = fixture.tempdir.child("detached.txt");
        file.write_str("detached content")?;
        let (mut server, mut client) = fixture.socket_pair().await?;

        server.send_file_detached(file.path());
        server.close().await?;

        assert_eq!(
            b"detached content".to_vec(),
            read_to_end(&mut client).await?
        );

        Ok(())
    }

    #[tokio::test]
    async fn send_missing_file() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let file = fixture.tempdir.child("missing.txt");
        let (mut server, mut client) = fixture.socket_pair().await?;

        assert!(matches!(
            server.send_file(file.path()).await,
            Err(FileError::Open { .. })
        ));

        // The socket is still usable.
        server.write("still here")?;
        assert_eq!(b"still here".to_vec(), read_exactly(&mut client, 10).await?);

        Ok(())
    }

    #[tokio::test]
    async fn send_directory() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (mut server, _client) = fixture.socket_pair().await?;

        assert!(matches!(
            server.send_file(fixture.tempdir.path()).await,
            Err(FileError::NotAFile { .. })
        ));

        Ok(())
    }

    #[tokio::test]
    async fn send_file_after_close() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let file = fixture.tempdir.child("late.txt");
        file.write_str("late")?;
        let (mut server, _client) = fixture.socket_pair().await?;

        server.close().await?;
        assert!(matches!(
            server.send_file(file.path()).await,
            Err(FileError::Interrupted { .. })
        ));

        Ok(())
    }

    #[tokio::test]
    async fn split_socket() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (server, mut client) = fixture.socket_pair().await?;
        let (mut reader, writer) = server.into_split()?;

        let echo = tokio::spawn(async move {
            while let Some(chunk) = reader.read_chunk().await? {
                writer.write(chunk)?;
            }
            writer.close().await?;

            Ok::<(), anyhow::Error>(())
        });

        client.write("ping")?;
        assert_eq!(b"ping".to_vec(), read_exactly(&mut client, 4).await?);
        client.writer()?.close().await?;
        echo.await??;

        Ok(())
    }

    #[tokio::test]
    async fn ssl_without_tls_config() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (mut server, _client) = fixture.socket_pair().await?;

        assert!(matches!(server.ssl().await, Err(TlsError::NotConfigured)));
        assert!(!server.is_ssl());

        Ok(())
    }

    #[tokio::test]
    async fn ssl_after_data() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let key_store = TestCerts::generate("localhost")
            .write_key_store(fixture.tempdir.child("keystore.pem").path())?;
        let acceptor = tls::make_tls_acceptor(&ServerTlsConfig::new(key_store))?;
        let (mut server, _client) = fixture.socket_pair_with_acceptor(Some(acceptor)).await?;

        server.write("plain")?;
        assert!(matches!(server.ssl().await, Err(TlsError::DataExchanged)));
        assert!(!server.is_ssl());

        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_socket() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (mut server, mut client) = fixture.socket_pair().await?;
        let writer = server.writer()?;
        client.write("x")?;

        fixture.scope.shutdown().await;

        assert!(writer.is_closed());
        assert!(matches!(writer.write("late"), Err(SocketError::Closed)));
        assert_eq!(None, server.read_chunk().await?);
        // Drained doesn't wait on a dead socket.
        tokio::time::timeout(Duration::from_secs(1), writer.drained()).await?;

        Ok(())
    }

    #[tokio::test]
    async fn write_queue_drained() -> anyhow::Result<()> {
        let queue = WriteQueue::new(8);
        assert!(!queue.is_full());

        queue.add(10);
        assert!(queue.is_full());

        let drained = queue.drained();
        tokio::pin!(drained);
        assert!(futures::poll!(drained.as_mut()).is_pending());

        // Still above the low water mark.
        queue.release(5);
        assert!(!queue.is_full());
        assert!(futures::poll!(drained.as_mut()).is_pending());

        queue.release(1);
        assert!(futures::poll!(drained.as_mut()).is_ready());

        Ok(())
    }

    #[tokio::test]
    async fn write_queue_max_size_change() -> anyhow::Result<()> {
        let queue = WriteQueue::new(8);
        queue.add(6);
        assert!(!queue.is_full());

        queue.set_max_size(4);
        assert!(queue.is_full());

        queue.set_max_size(100);
        assert!(!queue.is_full());
        queue.drained().await;

        Ok(())
    }

    #[tokio::test]
    async fn socket_write_queue() -> anyhow::Result<()> {
        let fixture = Fixture::setup()?;
        let (mut server, _client) = fixture.socket_pair().await?;

        // Not started yet.
        assert!(!server.write_queue_full());
        server.set_write_queue_max_size(16);
        server.write("small")?;
        tokio::time::timeout(Duration::from_secs(5), server.drained()).await?;
        assert!(!server.write_queue_full());

        Ok(())
    }

    #[tokio::test]
    async fn transmit_file_into_buffer() -> anyhow::Result<()> {
        let tempdir = TempDir::new()?;
        let file = tempdir.child("content.bin");
        file.write_binary(&[7u8; 20_000])?;

        let mut out = Vec::new();
        assert_eq!(20_000, transmit_file(&mut out, file.path()).await?);
        assert_eq!(vec![7u8; 20_000], out);

        Ok(())
    }
}
