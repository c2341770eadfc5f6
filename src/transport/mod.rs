//! Transport module for Sotproxy
//!
//! Outbound connections to targets, either dialed directly over TCP or
//! relayed through a remote instance over the TLS tunnel, plus the TLS
//! configuration shared by the tunnel, the tunnel server and the MITM path.

mod dialer;
mod tcp;
pub mod tls;
mod tunnel;

pub use dialer::Dialer;
pub use tcp::TcpTransport;
pub use tunnel::TunnelTransport;

use crate::config::TcpConfig;
use crate::socks::TargetAddr;
use crate::stream::SharedStream;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Options for accepted client sockets: no keepalive probing
    pub fn for_accepted() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: None,
            keepalive_interval: None,
        }
    }

    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// A way of reaching a target
///
/// The returned handle carries one reference owned by the caller.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Open a stream whose payload reaches `target`
    async fn connect(&self, target: &TargetAddr) -> Result<SharedStream>;
}
