//! Shared, reference-counted duplex stream handle
//!
//! A [`SharedStream`] wraps one raw transport and lets several logical owners
//! (protocol handler, both relay directions, a TLS layer) hold it at once.
//! Every owner obtained through [`SharedStream::open`] must eventually call
//! [`SharedStream::close`]; the transport is shut down exactly once, when the
//! reference count drops from 1 to 0.
//!
//! ```text
//! accept ──wrap()──► refs=1
//!   relay OUT: open() ► refs=2 ... close_read()  ► refs=1
//!   relay IN:  open() ► refs=3 ... close_write() ► refs=2
//!   handler:                        close()      ► refs=0 → transport closed
//! ```

mod read;
mod registry;

pub use registry::{live_count, live_streams, StreamInfo};

use crate::helper::DEFAULT_BUFFER_SIZE;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use read::ReadBuffer;
use registry::REGISTRY;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

/// Boxed read half of a raw transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a raw transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Capabilities a raw transport exposes to a [`SharedStream`]
///
/// Half-duplex shutdown is expressed through the write half's
/// `poll_shutdown`; transports that can split without locking override
/// [`RawStream::into_halves`].
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Remote address, if the transport has one
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Split into independently usable read and write halves
    fn into_halves(self) -> (BoxedReader, BoxedWriter)
    where
        Self: Sized,
    {
        let (r, w) = tokio::io::split(self);
        (Box::new(r), Box::new(w))
    }
}

impl RawStream for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn into_halves(self) -> (BoxedReader, BoxedWriter) {
        let (r, w) = self.into_split();
        (Box::new(r), Box::new(w))
    }
}

impl RawStream for DuplexStream {}

impl<IO> RawStream for tokio_rustls::server::TlsStream<IO> where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static
{
}

impl<IO> RawStream for tokio_rustls::client::TlsStream<IO> where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static
{
}

/// Conversion into a shared handle
///
/// Raw transports get a fresh handle; a handle converts to itself, leaving
/// the reference count untouched.
pub trait IntoShared {
    /// Wrap (or pass through) as a [`SharedStream`]
    fn into_shared(self) -> SharedStream;
}

impl<T: RawStream> IntoShared for T {
    fn into_shared(self) -> SharedStream {
        SharedStream::new(self)
    }
}

impl IntoShared for SharedStream {
    fn into_shared(self) -> SharedStream {
        self
    }
}

struct WriteSide {
    io: Option<BufWriter<BoxedWriter>>,
    shut: bool,
}

pub(crate) struct Inner {
    id: u64,
    peer: Option<SocketAddr>,
    refs: Mutex<usize>,
    reader: Mutex<Option<ReadBuffer>>,
    writer: Mutex<WriteSide>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        REGISTRY.remove(self.id);
    }
}

/// Reference-counted handle over one raw transport
///
/// Values returned by [`SharedStream::open`] alias the same handle. Reads
/// and writes go through an internal buffer, so bytes observed with
/// [`SharedStream::peek`] are still delivered to the next reader.
pub struct SharedStream {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStream")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("refs", &*self.inner.refs.lock())
            .finish()
    }
}

impl SharedStream {
    fn new<T: RawStream>(raw: T) -> Self {
        let peer = raw.peer_addr();
        let (reader, writer) = raw.into_halves();
        let inner = Arc::new(Inner {
            id: REGISTRY.next_id(),
            peer,
            refs: Mutex::new(1),
            reader: Mutex::new(Some(ReadBuffer::new(reader))),
            writer: Mutex::new(WriteSide {
                io: Some(BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, writer)),
                shut: false,
            }),
        });
        REGISTRY.insert(&inner);
        trace!("stream {} wrapped (peer {:?})", inner.id, peer);
        SharedStream { inner }
    }

    /// Wrap a raw transport, or return an existing handle unchanged
    pub fn wrap<T: IntoShared>(transport: T) -> Self {
        transport.into_shared()
    }

    /// Registry id of this handle
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote address of the underlying transport
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// Current reference count
    pub fn ref_count(&self) -> usize {
        *self.inner.refs.lock()
    }

    /// Whether the handle is still tracked by the live-stream registry
    pub fn is_registered(&self) -> bool {
        REGISTRY.contains(self.inner.id)
    }

    /// Take a new logical reference to the same handle
    pub fn open(&self) -> SharedStream {
        *self.inner.refs.lock() += 1;
        SharedStream {
            inner: self.inner.clone(),
        }
    }

    /// Return the next `n` bytes without consuming them
    ///
    /// Fails with `UnexpectedEof` if the transport ends first.
    pub async fn peek(&self, n: usize) -> io::Result<Bytes> {
        poll_fn(|cx| match self.inner.reader.lock().as_mut() {
            Some(reader) => reader.poll_peek(cx, n),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        })
        .await
    }

    /// Read one line including its terminator, at most `max` bytes long
    pub async fn read_line(&self, max: usize) -> io::Result<Option<BytesMut>> {
        poll_fn(|cx| match self.inner.reader.lock().as_mut() {
            Some(reader) => reader.poll_read_line(cx, max),
            None => Poll::Ready(Ok(None)),
        })
        .await
    }

    /// Push buffered output to the transport
    pub async fn flush(&self) -> io::Result<()> {
        poll_fn(|cx| {
            let mut writer = self.inner.writer.lock();
            if writer.shut {
                return Poll::Ready(Ok(()));
            }
            match writer.io.as_mut() {
                Some(io) => Pin::new(io).poll_flush(cx),
                None => Poll::Ready(Ok(())),
            }
        })
        .await
    }

    /// Drop one reference; the last one shuts the transport down
    pub async fn close(&self) -> io::Result<()> {
        if let Err(e) = self.flush().await {
            trace!("stream {} flush before close failed: {}", self.inner.id, e);
        }
        let last = {
            let mut refs = self.inner.refs.lock();
            if *refs == 0 {
                return Ok(());
            }
            *refs -= 1;
            *refs == 0
        };
        if !last {
            return Ok(());
        }
        REGISTRY.remove(self.inner.id);
        self.shutdown_transport().await
    }

    /// Stop reading from the transport, then [`close`](Self::close)
    pub async fn close_read(&self) -> io::Result<()> {
        if let Some(reader) = self.inner.reader.lock().as_mut() {
            reader.close();
        }
        self.close().await
    }

    /// Half-close the write direction, then [`close`](Self::close)
    ///
    /// The peer observes EOF while the read direction stays usable for
    /// other owners.
    pub async fn close_write(&self) -> io::Result<()> {
        if let Err(e) = self.shutdown_write().await {
            trace!("stream {} write shutdown failed: {}", self.inner.id, e);
        }
        self.close().await
    }

    /// Forget all references without closing the transport
    ///
    /// The transport is handed back so a new layer (TLS, journaling) can own
    /// it; any later `close` on this handle is a no-op. Returns `None` if the
    /// transport was already released.
    pub fn destroy(&self) -> Option<Detached> {
        *self.inner.refs.lock() = 0;
        REGISTRY.remove(self.inner.id);
        let reader = self.inner.reader.lock().take();
        let writer = self.inner.writer.lock().io.take();
        match (reader, writer) {
            (Some(reader), Some(writer)) => Some(Detached { reader, writer }),
            _ => None,
        }
    }

    async fn shutdown_write(&self) -> io::Result<()> {
        poll_fn(|cx| {
            let mut writer = self.inner.writer.lock();
            if writer.shut {
                return Poll::Ready(Ok(()));
            }
            let result = match writer.io.as_mut() {
                Some(io) => ready!(Pin::new(io).poll_shutdown(cx)),
                None => Ok(()),
            };
            writer.shut = true;
            Poll::Ready(result)
        })
        .await
    }

    async fn shutdown_transport(&self) -> io::Result<()> {
        let (writer, already_shut) = {
            let mut side = self.inner.writer.lock();
            (side.io.take(), side.shut)
        };
        let reader = self.inner.reader.lock().take();
        let result = match writer {
            Some(mut io) if !already_shut => io.shutdown().await,
            _ => Ok(()),
        };
        drop(reader);
        trace!("stream {} transport closed", self.inner.id);
        result
    }
}

impl AsyncRead for SharedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.inner.reader.lock().as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for SharedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut writer = self.inner.writer.lock();
        if writer.shut {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match writer.io.as_mut() {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut writer = self.inner.writer.lock();
        if writer.shut {
            return Poll::Ready(Ok(()));
        }
        match writer.io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut writer = self.inner.writer.lock();
        if writer.shut {
            return Poll::Ready(Ok(()));
        }
        let result = match writer.io.as_mut() {
            Some(io) => ready!(Pin::new(io).poll_shutdown(cx)),
            None => Ok(()),
        };
        writer.shut = true;
        Poll::Ready(result)
    }
}

/// A transport released by [`SharedStream::destroy`]
///
/// Still carries any bytes the old handle had buffered in either direction.
pub struct Detached {
    reader: ReadBuffer,
    writer: BufWriter<BoxedWriter>,
}

impl AsyncRead for Detached {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Detached {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

impl RawStream for Detached {
    fn into_halves(self) -> (BoxedReader, BoxedWriter) {
        (Box::new(self.reader), Box::new(self.writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{duplex, AsyncReadExt};

    /// Transport whose write half counts shutdowns and drops
    struct CountingTransport {
        inner: DuplexStream,
        shutdowns: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    struct CountingWriter {
        inner: tokio::io::WriteHalf<DuplexStream>,
        shutdowns: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for CountingWriter {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncWrite for CountingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            let res = ready!(Pin::new(&mut self.inner).poll_shutdown(cx));
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(res)
        }
    }

    impl AsyncRead for CountingTransport {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for CountingTransport {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl RawStream for CountingTransport {
        fn into_halves(self) -> (BoxedReader, BoxedWriter) {
            let (r, w) = tokio::io::split(self.inner);
            let writer = CountingWriter {
                inner: w,
                shutdowns: self.shutdowns,
                drops: self.drops,
            };
            (Box::new(r), Box::new(writer))
        }
    }

    fn counting() -> (SharedStream, DuplexStream, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (near, far) = duplex(4096);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let stream = SharedStream::wrap(CountingTransport {
            inner: near,
            shutdowns: shutdowns.clone(),
            drops: drops.clone(),
        });
        (stream, far, shutdowns, drops)
    }

    #[tokio::test]
    async fn test_wrap_is_idempotent() {
        let (a, _b) = duplex(64);
        let stream = SharedStream::wrap(a);
        let id = stream.id();
        let again = SharedStream::wrap(stream);
        assert_eq!(again.id(), id);
        assert_eq!(again.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_open_close_n_times_closes_once() {
        let (stream, _far, shutdowns, drops) = counting();
        let owners: Vec<SharedStream> = (0..5).map(|_| stream.open()).collect();
        assert_eq!(stream.ref_count(), 6);

        for owner in &owners {
            owner.close().await.unwrap();
            assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
            assert_eq!(drops.load(Ordering::SeqCst), 0);
        }
        assert!(stream.is_registered());

        stream.close().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!stream.is_registered());

        // Extra closes are no-ops.
        stream.close().await.unwrap();
        owners[0].close().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroy_then_close_does_not_touch_transport() {
        let (stream, _far, shutdowns, drops) = counting();
        let other = stream.open();

        let detached = stream.destroy().expect("transport still attached");
        assert_eq!(stream.ref_count(), 0);
        assert!(!stream.is_registered());

        other.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        // The new owner is now responsible for the transport.
        let rewrapped = SharedStream::wrap(detached);
        rewrapped.close().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_destroy_twice_returns_none() {
        let (a, _b) = duplex(64);
        let stream = SharedStream::wrap(a);
        assert!(stream.destroy().is_some());
        assert!(stream.destroy().is_none());
    }

    #[tokio::test]
    async fn test_detached_keeps_buffered_bytes() {
        let (a, mut b) = duplex(64);
        let stream = SharedStream::wrap(a);
        b.write_all(b"\x16\x03\x01rest").await.unwrap();
        let head = stream.peek(3).await.unwrap();
        assert_eq!(&head[..], b"\x16\x03\x01");

        let mut detached = stream.destroy().unwrap();
        let mut buf = [0u8; 7];
        detached.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x16\x03\x01rest");
    }

    #[tokio::test]
    async fn test_peek_then_read() {
        let (a, mut b) = duplex(64);
        let mut stream = SharedStream::wrap(a);
        b.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let first = stream.peek(1).await.unwrap();
        assert_eq!(&first[..], &[0x05]);

        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x05, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_peek_short_stream_fails() {
        let (a, mut b) = duplex(64);
        let stream = SharedStream::wrap(a);
        b.write_all(&[0x16, 0x03]).await.unwrap();
        drop(b);
        let err = stream.peek(6).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_writes_are_buffered_until_flush() {
        let (a, mut b) = duplex(64);
        let mut stream = SharedStream::wrap(a);
        stream.write_all(b"hi").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_close_write_keeps_read_direction() {
        let (a, mut b) = duplex(64);
        let stream = SharedStream::wrap(a);
        let mut reader = stream.open();
        let writer = stream.open();

        writer.close_write().await.unwrap();
        // Peer sees EOF on its read side.
        let mut buf = Vec::new();
        b.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        // The other direction still flows.
        b.write_all(b"late").await.unwrap();
        let mut got = [0u8; 4];
        reader.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"late");

        reader.close().await.unwrap();
        stream.close().await.unwrap();
        assert_eq!(stream.ref_count(), 0);
    }

    #[tokio::test]
    async fn test_close_read_reports_eof_to_reader() {
        let (a, mut b) = duplex(64);
        let mut stream = SharedStream::wrap(a);
        let owner = stream.open();
        b.write_all(b"ignored").await.unwrap();

        owner.close_read().await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_tracks_refs() {
        let (a, _b) = duplex(64);
        let stream = SharedStream::wrap(a);
        let extra = stream.open();

        let info = live_streams()
            .into_iter()
            .find(|info| info.id == stream.id())
            .expect("stream registered");
        assert_eq!(info.refs, 2);

        extra.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(live_streams().iter().all(|info| info.id != stream.id()));
    }

    #[tokio::test]
    async fn test_dropping_all_handles_unregisters() {
        let (a, _b) = duplex(64);
        let stream = SharedStream::wrap(a);
        let id = stream.id();
        drop(stream);
        assert!(!REGISTRY.contains(id));
    }

    #[tokio::test]
    async fn test_concurrent_close_from_many_tasks() {
        let (stream, _far, shutdowns, _drops) = counting();
        let owners: Vec<SharedStream> = (0..16).map(|_| stream.open()).collect();
        let tasks: Vec<_> = owners
            .into_iter()
            .map(|owner| tokio::spawn(async move { owner.close().await }))
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        stream.close().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
