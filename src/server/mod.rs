//! Server mode
//!
//! Terminates tunnel sessions from client instances: accepts TLS, reads the
//! length-prefixed target announcement, dials it in plaintext and relays.

use crate::config::Config;
use crate::diagnostics;
use crate::error::ProxyError;
use crate::helper::duration_from_secs;
use crate::protocol::read_target;
use crate::relay;
use crate::rules::HostMapping;
use crate::socks::TargetAddr;
use crate::stream::SharedStream;
use crate::transport::{tls, Dialer, SocketOpts, TcpTransport};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Bound tunnel server
pub struct Server {
    config: Config,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    dialer: Dialer,
}

impl Server {
    /// Load the server identity and bind the listener
    pub async fn bind(config: Config) -> Result<Self> {
        let acceptor = tls::tunnel_acceptor(&config.server)?;
        let direct = TcpTransport::with_defaults()
            .with_socket_opts(SocketOpts::from_tcp_config(&config.tcp))
            .with_connect_timeout(duration_from_secs(config.connect_timeout));
        let mapping = Arc::new(HostMapping::new(config.rules.host_mapping.clone()));
        let dialer = Dialer::direct(direct).with_mapping(mapping);

        let listener = TcpListener::bind(config.listen.as_str())
            .await
            .with_context(|| format!("Failed to listen on {}", config.listen))?;

        Ok(Server {
            config,
            listener,
            acceptor,
            dialer,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept tunnel sessions until shutdown
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        info!("Tunnel server listening on {}", self.local_addr()?);
        diagnostics::spawn(
            duration_from_secs(self.config.diagnostics_interval),
            shutdown_rx.resubscribe(),
        );

        let max_len = self.config.server.max_target_len;
        let opts = SocketOpts::for_accepted();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    if let Err(e) = opts.apply(&stream) {
                        debug!("Failed to set socket options for {}: {}", peer, e);
                    }
                    let acceptor = self.acceptor.clone();
                    let dialer = self.dialer.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_tunnel(&acceptor, &dialer, stream, max_len).await {
                            warn!("Tunnel from {}: {:#}", peer, e);
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping tunnel server");
                    break;
                }
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Serve one tunnel session to completion
async fn serve_tunnel(
    acceptor: &TlsAcceptor,
    dialer: &Dialer,
    stream: TcpStream,
    max_len: usize,
) -> Result<()> {
    let tls = acceptor
        .accept(stream)
        .await
        .context("TLS handshake failed")?;
    let mut conn = SharedStream::wrap(tls);

    let target = match read_announced(&mut conn, max_len).await {
        Ok(target) => target,
        Err(e) => {
            let _ = conn.close().await;
            return Err(e);
        }
    };
    debug!("Tunnel target {}", target);

    let remote = match dialer.dial(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            let _ = conn.close().await;
            return Err(e);
        }
    };
    relay::bridge(conn, remote).await;
    Ok(())
}

async fn read_announced(conn: &mut SharedStream, max_len: usize) -> Result<TargetAddr> {
    let raw = read_target(conn, max_len)
        .await
        .map_err(ProxyError::from)
        .context("Bad target announcement")?;
    raw.parse::<TargetAddr>()
        .with_context(|| format!("Bad tunnel target {:?}", raw))
}

/// Run server mode with the given configuration
pub async fn run_server(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    Server::bind(config).await?.run(shutdown_rx).await
}
