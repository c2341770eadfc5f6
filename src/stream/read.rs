//! Buffered read side of a shared stream
//!
//! Keeps bytes that were peeked or read past a line boundary so that later
//! readers observe them in order.

use super::BoxedReader;
use crate::helper::DEFAULT_BUFFER_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

pub(crate) struct ReadBuffer {
    io: BoxedReader,
    buf: BytesMut,
    eof: bool,
    closed: bool,
}

impl ReadBuffer {
    pub(crate) fn new(io: BoxedReader) -> Self {
        ReadBuffer {
            io,
            buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            eof: false,
            closed: false,
        }
    }

    /// Stop delivering data; subsequent reads observe EOF.
    pub(crate) fn close(&mut self) {
        self.closed = true;
        self.buf.clear();
    }

    /// Pull one more chunk from the transport into the buffer.
    ///
    /// Returns the number of bytes appended, 0 at EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if self.eof {
            return Poll::Ready(Ok(0));
        }
        let mut chunk = [0u8; DEFAULT_BUFFER_SIZE];
        let mut read_buf = ReadBuf::new(&mut chunk);
        ready!(Pin::new(&mut self.io).poll_read(cx, &mut read_buf))?;
        let filled = read_buf.filled();
        if filled.is_empty() {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(filled);
        }
        Poll::Ready(Ok(filled.len()))
    }

    pub(crate) fn poll_peek(&mut self, cx: &mut Context<'_>, n: usize) -> Poll<io::Result<Bytes>> {
        loop {
            if self.closed {
                return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
            }
            if self.buf.len() >= n {
                return Poll::Ready(Ok(Bytes::copy_from_slice(&self.buf[..n])));
            }
            if self.eof {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peek({}) hit EOF after {} bytes", n, self.buf.len()),
                )));
            }
            ready!(self.poll_fill(cx))?;
        }
    }

    /// Read up to and including the next `\n`.
    ///
    /// `Ok(None)` means EOF with nothing buffered. A final unterminated line
    /// is returned as-is.
    pub(crate) fn poll_read_line(
        &mut self,
        cx: &mut Context<'_>,
        max: usize,
    ) -> Poll<io::Result<Option<BytesMut>>> {
        loop {
            if self.closed {
                return Poll::Ready(Ok(None));
            }
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                return Poll::Ready(Ok(Some(self.buf.split_to(pos + 1))));
            }
            if self.buf.len() >= max {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {} bytes", max),
                )));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Poll::Ready(Ok(None));
                }
                return Poll::Ready(Ok(Some(self.buf.split())));
            }
            ready!(self.poll_fill(cx))?;
        }
    }
}

impl AsyncRead for ReadBuffer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        if this.buf.is_empty() {
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            return Pin::new(&mut this.io).poll_read(cx, out);
        }
        let n = this.buf.len().min(out.remaining());
        out.put_slice(&this.buf[..n]);
        this.buf.advance(n);
        Poll::Ready(Ok(()))
    }
}
