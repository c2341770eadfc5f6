//! TCP transport implementation
//!
//! Plain TCP connections straight to the target.

use super::{SocketOpts, Transport};
use crate::helper::DEFAULT_CONNECT_TIMEOUT_SECS;
use crate::socks::TargetAddr;
use crate::stream::SharedStream;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// TCP transport for plain connections
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Socket options to apply to connections
    socket_opts: SocketOpts,
    /// Connection timeout
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create a new TCP transport with default options
    pub fn with_defaults() -> Self {
        TcpTransport {
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve and dial `target`, returning the bare socket
    pub async fn connect_raw(&self, target: &TargetAddr) -> Result<TcpStream> {
        let resolved = target.resolve().await?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(resolved))
            .await
            .with_context(|| format!("Connection timeout to {}", target))?
            .with_context(|| format!("Failed to connect to {}", target))?;

        if let Err(e) = self.socket_opts.apply(&stream) {
            tracing::warn!("Failed to apply socket options: {}", e);
        }

        tracing::debug!("TCP connection established to {} ({})", target, resolved);

        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, target: &TargetAddr) -> Result<SharedStream> {
        let stream = self.connect_raw(target).await?;
        Ok(SharedStream::wrap(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_tcp_transport_with_defaults() {
        let transport = TcpTransport::with_defaults();
        assert!(transport.socket_opts.nodelay);
        assert_eq!(transport.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_tcp_transport_builders() {
        let opts = SocketOpts {
            nodelay: false,
            keepalive_secs: Some(60),
            keepalive_interval: Some(20),
        };
        let transport = TcpTransport::with_defaults()
            .with_socket_opts(opts)
            .with_connect_timeout(Duration::from_secs(30));
        assert!(!transport.socket_opts.nodelay);
        assert_eq!(transport.socket_opts.keepalive_secs, Some(60));
        assert_eq!(transport.connect_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_tcp_transport_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hi").await.unwrap();
        });

        let mut stream = TcpTransport::with_defaults()
            .connect(&TargetAddr::from(addr))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        assert_eq!(stream.peer_addr(), Some(addr));
        stream.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_transport_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransport::with_defaults()
            .connect(&TargetAddr::from(addr))
            .await;
        assert!(result.is_err());
    }
}
