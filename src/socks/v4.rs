//! SOCKS4 / SOCKS4A handshake
//!
//! ```text
//! +----+----+----+----+----+----+----+----+----+----+....+----+
//! | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
//! +----+----+----+----+----+----+----+----+----+----+....+----+
//!   1    1      2              4           variable       1
//! ```
//!
//! A DSTIP of `0.0.0.x` (x != 0) announces a null-terminated domain after
//! the user id.

use super::consts::*;
use super::types::TargetAddr;
use crate::error::SocksError;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Run the SOCKS4 handshake and return the requested target
///
/// The success reply is written before returning. A non-CONNECT command is
/// answered with a rejection reply.
pub async fn handshake<S>(stream: &mut S) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 8];
    stream.read_exact(&mut header[..2]).await?;

    let version = header[0];
    if version != SOCKS4_VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }
    let command = header[1];
    if command != SOCKS4_CMD_CONNECT {
        send_reply(stream, SOCKS4_REPLY_REJECTED).await?;
        return Err(SocksError::CommandNotSupported(command));
    }

    stream.read_exact(&mut header[2..]).await?;
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = Ipv4Addr::new(header[4], header[5], header[6], header[7]);

    let user = read_null_terminated(stream)
        .await?
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
    debug!("SOCKS4 user id: {:?}", String::from_utf8_lossy(&user));

    let target = if is_socks4a(&ip) {
        match read_null_terminated(stream).await? {
            Some(domain) if !domain.is_empty() => {
                let domain = String::from_utf8(domain)
                    .map_err(|e| SocksError::InvalidDomain(e.to_string()))?;
                TargetAddr::Domain(domain, port)
            }
            // Nothing followed the user id: keep the literal address.
            _ => TargetAddr::ipv4(ip, port),
        }
    } else {
        TargetAddr::ipv4(ip, port)
    };

    send_reply(stream, SOCKS4_REPLY_GRANTED).await?;
    debug!("SOCKS4 request to {}", target);
    Ok(target)
}

fn is_socks4a(ip: &Ipv4Addr) -> bool {
    let [a, b, c, d] = ip.octets();
    a == 0 && b == 0 && c == 0 && d != 0
}

/// Read bytes up to a NUL terminator
///
/// `Ok(None)` when the stream ends before any byte arrives; only the SOCKS4A
/// domain field accepts that.
async fn read_null_terminated<S>(stream: &mut S) -> Result<Option<Vec<u8>>, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if stream.read(&mut byte).await? == 0 {
            if field.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        if byte[0] == 0 {
            return Ok(Some(field));
        }
        if field.len() >= SOCKS4_MAX_FIELD_LEN {
            return Err(SocksError::InvalidDomain(format!(
                "field exceeds {} bytes",
                SOCKS4_MAX_FIELD_LEN
            )));
        }
        field.push(byte[0]);
    }
}

async fn send_reply<S>(stream: &mut S, status: u8) -> Result<(), SocksError>
where
    S: AsyncWrite + Unpin,
{
    let reply = [SOCKS4_REPLY_VERSION, status, 0, 0, 0, 0, 0, 0];
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}
