//! Chunked transfer coding
//!
//! ```text
//! <hex size>[;ext]\r\n <size bytes> \r\n ... 0\r\n [trailers] \r\n
//! ```

use crate::stream::SharedStream;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted chunk-size or trailer line
const MAX_LINE: usize = 4096;

fn bad_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

async fn next_line(src: &SharedStream) -> io::Result<bytes::BytesMut> {
    src.read_line(MAX_LINE)
        .await?
        .ok_or_else(|| io::ErrorKind::UnexpectedEof.into())
}

/// Parse a chunk-size line, ignoring extensions
pub fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = std::str::from_utf8(line).map_err(|_| bad_data("chunk size is not ASCII"))?;
    let size = line.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| bad_data(format!("bad chunk size {:?}", size)))
}

/// Decode a chunked body from `src` into `dst`
///
/// With `rechunk` the payload is written back in chunked form (one chunk per
/// input chunk plus the terminator); otherwise only the payload bytes are
/// written. Trailers are consumed and dropped. Returns payload bytes copied.
pub async fn copy_chunked<W>(src: &mut SharedStream, dst: &mut W, rechunk: bool) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let size = parse_chunk_size(&next_line(src).await?)?;
        if size == 0 {
            break;
        }
        if rechunk {
            dst.write_all(format!("{:x}\r\n", size).as_bytes()).await?;
        }
        let copied = tokio::io::copy(&mut (&mut *src).take(size), dst).await?;
        if copied != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("chunk truncated at {} of {} bytes", copied, size),
            ));
        }
        total += copied;
        if rechunk {
            dst.write_all(b"\r\n").await?;
        }
        let crlf = next_line(src).await?;
        if !crlf.iter().all(|b| *b == b'\r' || *b == b'\n') {
            return Err(bad_data("missing CRLF after chunk"));
        }
    }

    // Trailer section; a peer that closes right after the last chunk is tolerated.
    while let Some(line) = src.read_line(MAX_LINE).await? {
        if line.as_ref() == b"\r\n" || line.as_ref() == b"\n" {
            break;
        }
    }
    if rechunk {
        dst.write_all(b"0\r\n\r\n").await?;
    }
    dst.flush().await?;
    Ok(total)
}
