//! Protocol dispatcher
//!
//! Sniffs the first byte of an accepted connection and hands the stream to
//! the SOCKS4, SOCKS5 or HTTP engine.

use crate::http::HttpProxy;
use crate::relay;
use crate::socks::{self, TargetAddr, SOCKS4_VERSION, SOCKS5_VERSION};
use crate::stream::SharedStream;
use crate::transport::Dialer;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Protocol recognized from the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    /// SOCKS4 or SOCKS4A
    Socks4,
    /// SOCKS5
    Socks5,
    /// HTTP request line
    Http,
    /// Anything else
    Unknown(u8),
}

impl Sniffed {
    /// Classify `byte`; HTTP is only recognized when enabled
    pub fn from_byte(byte: u8, http_enabled: bool) -> Self {
        match byte {
            SOCKS4_VERSION => Sniffed::Socks4,
            SOCKS5_VERSION => Sniffed::Socks5,
            b'A'..=b'Z' if http_enabled => Sniffed::Http,
            other => Sniffed::Unknown(other),
        }
    }
}

/// Routes accepted client connections
#[derive(Debug)]
pub struct Dispatcher {
    dialer: Dialer,
    http: Option<Arc<HttpProxy>>,
}

impl Dispatcher {
    /// Create a dispatcher; `http` is `None` when HTTP support is off
    pub fn new(dialer: Dialer, http: Option<Arc<HttpProxy>>) -> Self {
        Self { dialer, http }
    }

    /// Serve one accepted connection to completion
    ///
    /// Consumes the caller's reference to `client`.
    pub async fn dispatch(&self, mut client: SharedStream) -> Result<()> {
        let first = match client.peek(1).await {
            Ok(first) => first[0],
            Err(e) => {
                let _ = client.close().await;
                return Err(e).context("Failed to read first byte");
            }
        };

        let target = match (Sniffed::from_byte(first, self.http.is_some()), &self.http) {
            (Sniffed::Socks4, _) => socks::v4::handshake(&mut client)
                .await
                .context("SOCKS4 handshake failed"),
            (Sniffed::Socks5, _) => socks::v5::handshake(&mut client)
                .await
                .context("SOCKS5 handshake failed"),
            (Sniffed::Http, Some(http)) => return http.clone().handle(client).await,
            _ => {
                let _ = client.close().await;
                bail!("Unrecognized protocol (first byte 0x{:02x})", first);
            }
        };

        match target {
            Ok(target) => self.connect(client, target).await,
            Err(e) => {
                let _ = client.close().await;
                Err(e)
            }
        }
    }

    async fn connect(&self, client: SharedStream, target: TargetAddr) -> Result<()> {
        info!("{:?} -> {}", client.peer_addr(), target);
        let remote = match self.dialer.dial(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                let _ = client.close().await;
                return Err(e);
            }
        };
        let (out, inbound) = relay::bridge(client, remote).await;
        debug!("{} finished: {} / {}", target, out, inbound);
        Ok(())
    }
}
