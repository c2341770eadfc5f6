//! Target dialer
//!
//! Applies host mapping, then picks the tunnel or a direct dial. Hosts on
//! the local-only list are always dialed directly.

use super::{SocketOpts, TcpTransport, Transport, TunnelTransport};
use crate::config::Config;
use crate::rules::{HostMapping, LocalOnlyList};
use crate::socks::TargetAddr;
use crate::stream::SharedStream;
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Chooses how each target is reached
#[derive(Debug, Clone)]
pub struct Dialer {
    direct: TcpTransport,
    tunnel: Option<TunnelTransport>,
    mapping: Arc<HostMapping>,
    local_only: Arc<LocalOnlyList>,
}

impl Dialer {
    /// Dialer that always connects directly
    pub fn direct(direct: TcpTransport) -> Self {
        Self {
            direct,
            tunnel: None,
            mapping: Arc::new(HostMapping::default()),
            local_only: Arc::new(LocalOnlyList::default()),
        }
    }

    /// Dialer built from the configuration and shared rule tables
    pub fn from_config(
        config: &Config,
        mapping: Arc<HostMapping>,
        local_only: Arc<LocalOnlyList>,
    ) -> Result<Self> {
        let direct = TcpTransport::with_defaults()
            .with_socket_opts(SocketOpts::from_tcp_config(&config.tcp))
            .with_connect_timeout(crate::helper::duration_from_secs(config.connect_timeout));
        let tunnel = match &config.tunnel {
            Some(tunnel) => Some(TunnelTransport::new(tunnel, direct.clone())?),
            None => None,
        };
        Ok(Self {
            direct,
            tunnel,
            mapping,
            local_only,
        })
    }

    /// Use `tunnel` for targets not on the local-only list
    pub fn with_tunnel(mut self, tunnel: TunnelTransport) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Replace the host mapping table
    pub fn with_mapping(mut self, mapping: Arc<HostMapping>) -> Self {
        self.mapping = mapping;
        self
    }

    /// Replace the local-only list
    pub fn with_local_only(mut self, local_only: Arc<LocalOnlyList>) -> Self {
        self.local_only = local_only;
        self
    }

    /// Whether a tunnel is configured
    pub fn is_tunneled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Open a stream to `target`
    pub async fn dial(&self, target: &TargetAddr) -> Result<SharedStream> {
        let mapped = self.mapping.map_target(target);
        match &self.tunnel {
            Some(tunnel) if !self.local_only.is_local_only(&mapped.host()) => {
                debug!("dial {} via tunnel", mapped);
                tunnel.connect(&mapped).await
            }
            _ => {
                debug!("dial {} directly", mapped);
                self.direct.connect(&mapped).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_dial_applies_host_mapping() {
        let addr = echo_server().await;
        let mapping = Arc::new(HostMapping::default());
        mapping.add("echo.test", "127.0.0.1");
        let dialer = Dialer::direct(TcpTransport::with_defaults()).with_mapping(mapping);

        let mut stream = dialer
            .dial(&TargetAddr::Domain("echo.test".into(), addr.port()))
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_only_bypasses_tunnel() {
        let addr = echo_server().await;
        // The tunnel points nowhere; a local-only target must not use it.
        let tunnel =
            TunnelTransport::new(&TunnelConfig::new("127.0.0.1:1"), TcpTransport::with_defaults())
                .unwrap();
        let local_only = Arc::new(LocalOnlyList::new(&["^127\\.".to_string()], None).unwrap());
        let dialer = Dialer::direct(TcpTransport::with_defaults())
            .with_tunnel(tunnel)
            .with_local_only(local_only);
        assert!(dialer.is_tunneled());

        let mut stream = dialer.dial(&TargetAddr::from(addr)).await.unwrap();
        stream.write_all(b"local").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"local");
        stream.close().await.unwrap();
    }

    #[test]
    fn test_from_config_without_tunnel() {
        let config = Config::default();
        let dialer = Dialer::from_config(
            &config,
            Arc::new(HostMapping::default()),
            Arc::new(LocalOnlyList::default()),
        )
        .unwrap();
        assert!(!dialer.is_tunneled());
    }
}
