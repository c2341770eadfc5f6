//! Bidirectional relay between two shared streams
//!
//! Each direction is an independent task that copies until EOF or error and
//! then half-closes only the sides it used, so the opposite direction can
//! keep running until its own EOF.

use crate::helper::{format_bytes, throughput};
use crate::stream::SharedStream;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Direction label used in relay logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Client to target
    Out,
    /// Target to client
    In,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Out => write!(f, "OUT"),
            Flow::In => write!(f, "IN"),
        }
    }
}

/// Outcome of one relay direction
#[derive(Debug)]
pub struct RelayStats {
    /// Which way the bytes went
    pub flow: Flow,
    /// Bytes copied
    pub bytes: u64,
    /// Wall time from start to EOF or error
    pub elapsed: Duration,
    /// Terminal error, `None` on clean EOF
    pub error: Option<io::Error>,
}

impl RelayStats {
    /// Bytes per second over the whole transfer
    pub fn throughput(&self) -> f64 {
        throughput(self.bytes, self.elapsed)
    }
}

impl fmt::Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}/s {:?} --> ",
            self.flow,
            self.bytes,
            format_bytes(self.bytes as f64),
            format_bytes(self.throughput()),
            self.elapsed
        )?;
        match &self.error {
            Some(e) => write!(f, "{}", e),
            None => write!(f, "<eof>"),
        }
    }
}

/// Writer that tallies every byte the inner writer accepted
///
/// The tally survives a failed copy, so partial transfers are still counted.
pub struct CountingWriter<'a, W> {
    inner: &'a mut W,
    written: u64,
}

impl<'a, W> CountingWriter<'a, W> {
    pub fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<'_, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.written += *n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Copy everything from `src` into `dst`
///
/// On completion the read side of `src` and the write side of `dst` are
/// closed; each call consumes one reference of each handle.
pub async fn relay(mut dst: SharedStream, mut src: SharedStream, flow: Flow) -> RelayStats {
    let start = Instant::now();
    let mut counted = CountingWriter::new(&mut dst);
    let error = tokio::io::copy(&mut src, &mut counted).await.err();
    let bytes = counted.written();
    let elapsed = start.elapsed();

    if let Err(e) = src.close_read().await {
        debug!("{} source close failed: {}", flow, e);
    }
    if let Err(e) = dst.close_write().await {
        debug!("{} destination close failed: {}", flow, e);
    }

    let stats = RelayStats {
        flow,
        bytes,
        elapsed,
        error,
    };
    info!("{}", stats);
    stats
}

/// Start both relay directions between `client` and `target`
///
/// Takes a fresh reference of each handle per direction; the caller keeps
/// (and must still close) its own references.
pub fn spawn_pair(
    client: &SharedStream,
    target: &SharedStream,
) -> (JoinHandle<RelayStats>, JoinHandle<RelayStats>) {
    let out = tokio::spawn(relay(target.open(), client.open(), Flow::Out));
    let inbound = tokio::spawn(relay(client.open(), target.open(), Flow::In));
    (out, inbound)
}

/// Relay both directions and release the caller's references
///
/// Returns once both directions finished.
pub async fn bridge(client: SharedStream, target: SharedStream) -> (RelayStats, RelayStats) {
    let (out, inbound) = spawn_pair(&client, &target);
    let _ = client.close().await;
    let _ = target.close().await;
    let out = out.await.unwrap_or_else(|e| joined_error(Flow::Out, e));
    let inbound = inbound.await.unwrap_or_else(|e| joined_error(Flow::In, e));
    (out, inbound)
}

fn joined_error(flow: Flow, e: tokio::task::JoinError) -> RelayStats {
    RelayStats {
        flow,
        bytes: 0,
        elapsed: Duration::ZERO,
        error: Some(io::Error::new(io::ErrorKind::Other, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connect, accept) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connect.unwrap(), accept.unwrap().0)
    }

    #[test]
    fn test_flow_display() {
        assert_eq!(Flow::Out.to_string(), "OUT");
        assert_eq!(Flow::In.to_string(), "IN");
    }

    #[test]
    fn test_stats_display() {
        let stats = RelayStats {
            flow: Flow::Out,
            bytes: 2048,
            elapsed: Duration::from_secs(1),
            error: None,
        };
        let line = stats.to_string();
        assert!(line.starts_with("OUT 2048 2.00K 2.00K/s"));
        assert!(line.ends_with("<eof>"));
    }

    #[tokio::test]
    async fn test_relay_copies_and_half_closes() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);
        let src = SharedStream::wrap(a);
        let dst = SharedStream::wrap(b);

        a_peer.write_all(b"payload").await.unwrap();
        a_peer.shutdown().await.unwrap();

        let stats = relay(dst, src, Flow::Out).await;
        assert_eq!(stats.bytes, 7);
        assert!(stats.error.is_none());

        let mut got = Vec::new();
        b_peer.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"payload");
    }

    #[tokio::test]
    async fn test_one_megabyte_with_idle_opposite_direction() {
        // client_app <-> [client] proxy [target] <-> server_app
        let (mut client_app, client) = tcp_pair().await;
        let (target, mut server_app) = tcp_pair().await;
        let client = SharedStream::wrap(client);
        let target = SharedStream::wrap(target);

        let (out, inbound) = spawn_pair(&client, &target);
        client.close().await.unwrap();
        target.close().await.unwrap();

        let payload = vec![0xabu8; 1024 * 1024];
        client_app.write_all(&payload).await.unwrap();
        client_app.shutdown().await.unwrap();

        let mut received = Vec::new();
        server_app.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), payload.len());

        let out = out.await.unwrap();
        assert_eq!(out.bytes, 1024 * 1024);
        assert!(out.error.is_none());
        assert!(!inbound.is_finished());

        // The idle direction still works after the busy one finished.
        server_app.write_all(b"reply").await.unwrap();
        server_app.shutdown().await.unwrap();
        let mut reply = Vec::new();
        client_app.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"reply");

        let inbound = inbound.await.unwrap();
        assert_eq!(inbound.bytes, 5);
    }

    #[tokio::test]
    async fn test_failed_copy_keeps_partial_count() {
        let (a, mut a_peer) = tokio::io::duplex(4096);
        let (b, mut b_peer) = tokio::io::duplex(4096);
        let src = SharedStream::wrap(a);
        let dst = SharedStream::wrap(b);

        let task = tokio::spawn(relay(dst, src, Flow::Out));
        a_peer.write_all(&[7u8; 1000]).await.unwrap();
        let mut got = vec![0u8; 1000];
        b_peer.read_exact(&mut got).await.unwrap();
        drop(b_peer);
        a_peer.write_all(b"more").await.unwrap();

        let stats = task.await.unwrap();
        assert!(stats.error.is_some());
        assert_eq!(stats.bytes, 1000);
    }

    #[tokio::test]
    async fn test_counting_writer_tallies_writes() {
        let mut sink = Vec::new();
        let mut counted = CountingWriter::new(&mut sink);
        counted.write_all(b"abc").await.unwrap();
        counted.write_all(b"de").await.unwrap();
        assert_eq!(counted.written(), 5);
        assert_eq!(sink, b"abcde");
    }

    #[tokio::test]
    async fn test_bridge_releases_all_references() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);
        let client = SharedStream::wrap(a);
        let target = SharedStream::wrap(b);
        let watch_client = client.open();
        let watch_target = target.open();

        let task = tokio::spawn(bridge(client, target));
        a_peer.write_all(b"ping").await.unwrap();
        a_peer.shutdown().await.unwrap();
        b_peer.write_all(b"pong").await.unwrap();
        b_peer.shutdown().await.unwrap();

        let (out, inbound) = task.await.unwrap();
        assert_eq!(out.bytes, 4);
        assert_eq!(inbound.bytes, 4);
        assert_eq!(watch_client.ref_count(), 1);
        assert_eq!(watch_target.ref_count(), 1);
        watch_client.close().await.unwrap();
        watch_target.close().await.unwrap();
        assert_eq!(watch_client.ref_count(), 0);
    }
}
