//! TLS interception
//!
//! Terminates a client's TLS session locally with a leaf certificate issued
//! for the server name the client asked for.

use crate::ca::CertificateAuthority;
use crate::stream::SharedStream;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

/// Bytes needed by [`is_client_hello`]
pub const SNIFF_LEN: usize = 6;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Whether the first bytes of a stream look like a TLS ClientHello
///
/// Record type handshake, major version 3, minor version up to 3 (SSL 3.0
/// through TLS 1.2 record versions) and a ClientHello message type.
pub fn is_client_hello(head: &[u8]) -> bool {
    head.len() >= SNIFF_LEN
        && head[0] == RECORD_HANDSHAKE
        && head[1] == 0x03
        && head[2] <= 0x03
        && head[5] == HANDSHAKE_CLIENT_HELLO
}

/// Record-layer version label for logs
pub fn record_version(minor: u8) -> &'static str {
    match minor {
        0 => "SSL 3.0",
        1 => "TLS 1.0",
        2 => "TLS 1.1",
        3 => "TLS 1.2",
        _ => "unknown",
    }
}

/// Accept the client's TLS session on `client`
///
/// The certificate is issued for the ClientHello's SNI, or `fallback_host`
/// when the client sent none. An issuance failure aborts the handshake.
/// The old handle is destroyed; the returned handle owns the transport.
pub async fn terminate(
    ca: &CertificateAuthority,
    client: SharedStream,
    fallback_host: &str,
) -> Result<SharedStream> {
    let raw = client
        .destroy()
        .ok_or_else(|| anyhow!("Stream {} already released", client.id()))?;

    let start = LazyConfigAcceptor::new(Acceptor::default(), raw)
        .await
        .with_context(|| "Failed to read ClientHello")?;
    let sni = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| fallback_host.to_string());

    let leaf = ca
        .issue(&sni)
        .await
        .with_context(|| format!("Certificate issuance failed for {}", sni))?;
    debug!("Serving {} with certificate {}", sni, leaf.name());

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(leaf.chain(), leaf.private_key())
        .with_context(|| format!("Unusable certificate for {}", sni))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    let tls = start
        .into_stream(Arc::new(config))
        .await
        .with_context(|| format!("TLS handshake with client failed for {}", sni))?;
    Ok(SharedStream::wrap(tls))
}
