//! SOCKS5 handshake (no authentication, CONNECT only)
//!
//! # Request Format
//!
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```

use super::consts::*;
use super::types::TargetAddr;
use crate::error::{SocksError, SocksReplyCode};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Fixed success reply; the bound address is a zero placeholder
pub const SUCCESS_REPLY: [u8; 10] = [
    SOCKS5_VERSION,
    SocksReplyCode::Succeeded as u8,
    SOCKS5_RESERVED,
    SOCKS5_ADDR_TYPE_IPV4,
    0,
    0,
    0,
    0,
    0,
    0,
];

/// Run the SOCKS5 method negotiation and CONNECT request
///
/// Replies `{5, 0}` to the greeting when "no authentication" is offered,
/// `{5, 0xFF}` otherwise. The success reply is written before returning.
pub async fn handshake<S>(stream: &mut S) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream).await?;
    let target = parse_request(stream).await?;
    stream.write_all(&SUCCESS_REPLY).await?;
    stream.flush().await?;
    debug!("SOCKS5 request to {}", target);
    Ok(target)
}

async fn negotiate_method<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        return Err(SocksError::NoAcceptableMethod);
    }

    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
        .await?;
    stream.flush().await?;
    Ok(())
}

async fn parse_request<S>(stream: &mut S) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER CMD
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(header[0]));
    }
    if header[1] != SOCKS5_CMD_TCP_CONNECT {
        stream
            .write_all(&[SOCKS5_VERSION, SocksReplyCode::CommandNotSupported.into()])
            .await?;
        stream.flush().await?;
        return Err(SocksError::CommandNotSupported(header[1]));
    }

    // RSV ATYP
    let mut rsv_atyp = [0u8; 2];
    stream.read_exact(&mut rsv_atyp).await?;

    match rsv_atyp[1] {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Ok(TargetAddr::ipv4(Ipv4Addr::from(addr), port))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 || len > MAX_DOMAIN_LEN {
                return Err(SocksError::InvalidDomain(format!("length {}", len)));
            }
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain =
                String::from_utf8(domain).map_err(|e| SocksError::InvalidDomain(e.to_string()))?;
            let port = read_port(stream).await?;
            Ok(TargetAddr::Domain(domain, port))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = read_port(stream).await?;
            Ok(TargetAddr::ipv6(Ipv6Addr::from(addr), port))
        }

        other => {
            let mut reply = SUCCESS_REPLY;
            reply[1] = SocksReplyCode::AddressTypeNotSupported.into();
            stream.write_all(&reply).await?;
            stream.flush().await?;
            Err(SocksError::AddressTypeNotSupported(other))
        }
    }
}

async fn read_port<S>(stream: &mut S) -> Result<u16, SocksError>
where
    S: AsyncRead + Unpin,
{
    Ok(stream.read_u16().await?)
}
