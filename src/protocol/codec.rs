//! Tunnel frame codec
//!
//! The only framing on a tunnel session is the target announcement:
//!
//! ```text
//! +----------------+------------------------+
//! | LEN (u32, BE)  | TARGET (LEN bytes)     |
//! +----------------+------------------------+
//! ```
//!
//! `TARGET` is a UTF-8 `host:port`. Everything after it is raw payload.

use crate::error::FrameError;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Default upper bound for the target length
pub const DEFAULT_MAX_TARGET_LEN: usize = 1024;

/// Size of the length prefix
pub const LEN_PREFIX_SIZE: usize = 4;

/// Encode a target announcement into a buffer
pub fn encode_target(target: &str, max_len: usize) -> Result<BytesMut, FrameError> {
    let len = target.len();
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > max_len {
        return Err(FrameError::TooLong { len, max: max_len });
    }
    let mut buf = BytesMut::with_capacity(LEN_PREFIX_SIZE + len);
    buf.put_u32(len as u32);
    buf.put_slice(target.as_bytes());
    Ok(buf)
}

/// Write a target announcement to the stream
pub async fn write_target<T: AsyncWrite + Unpin>(
    conn: &mut T,
    target: &str,
    max_len: usize,
) -> Result<(), FrameError> {
    let buf = encode_target(target, max_len)?;
    conn.write_all(&buf).await?;
    conn.flush().await?;
    trace!("Wrote tunnel target {}", target);
    Ok(())
}

/// Read a target announcement from the stream
///
/// A declared length above `max_len` is rejected before any payload byte is
/// read.
pub async fn read_target<T: AsyncRead + Unpin>(
    conn: &mut T,
    max_len: usize,
) -> Result<String, FrameError> {
    let len = conn.read_u32().await? as usize;
    if len == 0 {
        return Err(FrameError::Empty);
    }
    if len > max_len {
        return Err(FrameError::TooLong { len, max: max_len });
    }
    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf).await?;
    let target = String::from_utf8(buf).map_err(|_| FrameError::InvalidUtf8)?;
    trace!("Read tunnel target {}", target);
    Ok(target)
}
