//! HTTP/1.x message heads
//!
//! Heads are read line by line from a [`SharedStream`] (so the body stays
//! buffered in the handle) and parsed with `httparse`.

use crate::error::ProxyError;
use crate::stream::SharedStream;
use bytes::{BufMut, BytesMut};
use std::borrow::Cow;
use std::io;

/// Largest accepted head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

/// Headers that only concern one hop
pub const HOP_BY_HOP: &[&str] = &[
    "Proxy-Connection",
    "Connection",
    "Proxy-Authenticate",
    "Keep-Alive",
];

/// Ordered header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// First value of `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Append a header
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace all values of `name` with one
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.append(name, value);
    }

    /// Drop all values of `name`
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Drop hop-by-hop headers
    pub fn strip_hop_by_hop(&mut self) {
        for name in HOP_BY_HOP {
            self.remove(name);
        }
    }

    /// Iterate in wire order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Declared `Content-Length`
    pub fn content_length(&self) -> Option<u64> {
        self.get("Content-Length")?.trim().parse().ok()
    }

    /// Whether the body uses chunked transfer coding
    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .map(|v| {
                v.rsplit(',')
                    .next()
                    .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    }

    fn from_parsed(raw: &[httparse::Header<'_>]) -> Self {
        Headers(
            raw.iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
        )
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        for (k, v) in &self.0 {
            buf.put_slice(k.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(v.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

/// Read raw head bytes up to and including the blank line
///
/// `Ok(None)` if the peer closed before sending anything.
pub async fn read_raw_head(stream: &SharedStream) -> io::Result<Option<BytesMut>> {
    let mut head = BytesMut::new();
    loop {
        let remaining = MAX_HEAD_SIZE.saturating_sub(head.len()).max(1);
        let line = match stream.read_line(remaining).await? {
            Some(line) => line,
            None if head.is_empty() => return Ok(None),
            None => return Err(io::ErrorKind::UnexpectedEof.into()),
        };
        let blank = line.as_ref() == b"\r\n" || line.as_ref() == b"\n";
        if blank && head.is_empty() {
            // Stray CRLF between messages.
            continue;
        }
        head.extend_from_slice(&line);
        if blank {
            return Ok(Some(head));
        }
        if head.len() >= MAX_HEAD_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("head exceeds {} bytes", MAX_HEAD_SIZE),
            ));
        }
    }
}

/// Request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Method token
    pub method: String,
    /// Request target as sent (origin, absolute or authority form)
    pub uri: String,
    /// Minor HTTP version
    pub version: u8,
    /// Header fields
    pub headers: Headers,
}

impl RequestHead {
    /// Parse a complete request head
    pub fn parse(buf: &[u8]) -> Result<Self, ProxyError> {
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut raw);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(_)) => Ok(RequestHead {
                method: req.method.unwrap_or_default().to_string(),
                uri: req.path.unwrap_or_default().to_string(),
                version: req.version.unwrap_or(1),
                headers: Headers::from_parsed(req.headers),
            }),
            Ok(httparse::Status::Partial) => {
                Err(ProxyError::Http("incomplete request head".into()))
            }
            Err(e) => Err(ProxyError::Http(format!("bad request head: {}", e))),
        }
    }

    /// Read and parse the next request head
    pub async fn read(stream: &SharedStream) -> Result<Option<Self>, ProxyError> {
        match read_raw_head(stream).await? {
            Some(buf) => Self::parse(&buf).map(Some),
            None => Ok(None),
        }
    }

    /// Whether this is a CONNECT request
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Serialize with `target` as the request target
    pub fn encode(&self, target: &str) -> BytesMut {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(target.as_bytes());
        buf.put_slice(format!(" HTTP/1.{}\r\n", self.version).as_bytes());
        self.headers.encode_into(&mut buf);
        buf.put_slice(b"\r\n");
        buf
    }
}

/// Status line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Minor HTTP version
    pub version: u8,
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Header fields
    pub headers: Headers,
}

impl ResponseHead {
    /// Head with the standard reason phrase for `status`
    pub fn new(status: u16) -> Self {
        ResponseHead {
            version: 1,
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::default(),
        }
    }

    /// Parse a complete response head
    pub fn parse(buf: &[u8]) -> Result<Self, ProxyError> {
        let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut raw);
        match resp.parse(buf) {
            Ok(httparse::Status::Complete(_)) => Ok(ResponseHead {
                version: resp.version.unwrap_or(1),
                status: resp.code.unwrap_or_default(),
                reason: resp.reason.unwrap_or_default().to_string(),
                headers: Headers::from_parsed(resp.headers),
            }),
            Ok(httparse::Status::Partial) => {
                Err(ProxyError::Http("incomplete response head".into()))
            }
            Err(e) => Err(ProxyError::Http(format!("bad response head: {}", e))),
        }
    }

    /// Read and parse the next response head
    pub async fn read(stream: &SharedStream) -> Result<Self, ProxyError> {
        match read_raw_head(stream).await? {
            Some(buf) => Self::parse(&buf),
            None => Err(ProxyError::Http("upstream closed before responding".into())),
        }
    }

    /// Serialize the head
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(512);
        buf.put_slice(
            format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason).as_bytes(),
        );
        self.headers.encode_into(&mut buf);
        buf.put_slice(b"\r\n");
        buf
    }
}

/// Standard reason phrase
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Strip the scheme and authority from an absolute-form target
///
/// The scheme is matched case-insensitively. A query directly after the
/// authority keeps its leading `/`.
pub fn origin_form(uri: &str) -> Cow<'_, str> {
    let rest = ["http://", "https://"].iter().find_map(|scheme| {
        uri.get(..scheme.len())
            .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
            .map(|_| &uri[scheme.len()..])
    });
    let Some(rest) = rest else {
        return Cow::Borrowed(uri);
    };
    match rest.find(['/', '?']) {
        Some(idx) if rest[idx..].starts_with('/') => Cow::Borrowed(&rest[idx..]),
        Some(idx) => Cow::Owned(format!("/{}", &rest[idx..])),
        None => Cow::Borrowed("/"),
    }
}

/// Absolute URL for a request target received over `scheme`
pub fn full_url(scheme: &str, host: &str, uri: &str) -> String {
    if uri.starts_with('/') {
        format!("{}://{}{}", scheme, host, uri)
    } else {
        uri.to_string()
    }
}
