//! Tunnel client transport
//!
//! Reaches targets through a remote server instance: TCP to the remote, a
//! TLS session on top, then a length-prefixed target announcement. After
//! the announcement the stream carries raw payload only.

use super::tls::{server_name, tunnel_connector};
use super::{TcpTransport, Transport};
use crate::config::TunnelConfig;
use crate::protocol::write_target;
use crate::socks::TargetAddr;
use crate::stream::SharedStream;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Transport relaying through a remote instance
#[derive(Clone)]
pub struct TunnelTransport {
    remote: TargetAddr,
    tcp: TcpTransport,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    max_target_len: usize,
}

impl std::fmt::Debug for TunnelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTransport")
            .field("remote", &self.remote)
            .field("server_name", &self.server_name)
            .field("max_target_len", &self.max_target_len)
            .finish()
    }
}

impl TunnelTransport {
    /// Create a tunnel transport from configuration
    ///
    /// The TLS server name defaults to the remote's host.
    pub fn new(config: &TunnelConfig, tcp: TcpTransport) -> Result<Self> {
        let remote: TargetAddr = config
            .remote_addr
            .parse()
            .with_context(|| format!("Invalid tunnel remote: {}", config.remote_addr))?;
        let hostname = config.tls.hostname.clone().unwrap_or_else(|| remote.host());
        Ok(TunnelTransport {
            server_name: server_name(&hostname)?,
            connector: tunnel_connector(&config.tls)?,
            remote,
            tcp,
            max_target_len: config.max_target_len,
        })
    }

    /// Remote instance address
    pub fn remote(&self) -> &TargetAddr {
        &self.remote
    }
}

#[async_trait]
impl Transport for TunnelTransport {
    async fn connect(&self, target: &TargetAddr) -> Result<SharedStream> {
        let tcp = self.tcp.connect_raw(&self.remote).await?;
        let tls = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .with_context(|| format!("TLS handshake failed with {}", self.remote))?;

        let mut stream = SharedStream::wrap(tls);
        if let Err(e) = write_target(&mut stream, &target.to_string(), self.max_target_len).await
        {
            let _ = stream.close().await;
            return Err(e).with_context(|| format!("Failed to announce {}", target));
        }
        debug!("Tunnel to {} via {}", target, self.remote);
        Ok(stream)
    }
}
