//! HTTP proxy and TLS interception engine
//!
//! Serves one request per client connection:
//!
//! - `CONNECT host:port`: answers 200 and either relays the tunnel opaquely
//!   or, with `decrypt_https` and a ClientHello on the wire, terminates TLS
//!   with a forged certificate and serves the decrypted stream again;
//! - the hello page and the root certificate download are served locally;
//! - a path redirect may answer locally;
//! - everything else is forwarded with hop-by-hop headers stripped and
//!   `Connection: close`, and the response streamed back.

pub mod chunked;
pub mod head;
pub mod mitm;
mod pages;
pub mod redirect;
pub mod session;

pub use redirect::{PathRedirects, Redirect};
pub use session::{Protocol, RequestInfo, ResponseInfo, SessionEvent, SessionInfo, SessionLog};

use crate::ca::CertificateAuthority;
use crate::config::HttpConfig;
use crate::relay::{self, CountingWriter, Flow, RelayStats};
use crate::socks::TargetAddr;
use crate::stream::SharedStream;
use crate::transport::{tls, Dialer};
use anyhow::{anyhow, Context, Result};
use chunked::copy_chunked;
use head::{full_url, origin_form, RequestHead, ResponseHead};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

/// Default port of plain HTTP targets
pub const HTTP_PORT: u16 = 80;

/// Default port of CONNECT and HTTPS targets
pub const HTTPS_PORT: u16 = 443;

type Served = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Transport a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn protocol(self) -> Protocol {
        match self {
            Scheme::Http => Protocol::Http,
            Scheme::Https => Protocol::Https,
        }
    }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Chunked,
    Fixed(u64),
    UntilEof,
}

impl BodyKind {
    fn of_request(head: &RequestHead) -> Self {
        if head.headers.is_chunked() {
            BodyKind::Chunked
        } else {
            match head.headers.content_length() {
                Some(n) if n > 0 => BodyKind::Fixed(n),
                _ => BodyKind::Empty,
            }
        }
    }

    fn of_response(method: &str, head: &ResponseHead) -> Self {
        if method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&head.status)
            || head.status == 204
            || head.status == 304
        {
            return BodyKind::Empty;
        }
        if head.headers.is_chunked() {
            return BodyKind::Chunked;
        }
        match head.headers.content_length() {
            Some(0) => BodyKind::Empty,
            Some(n) => BodyKind::Fixed(n),
            None => BodyKind::UntilEof,
        }
    }
}

/// HTTP proxy shared by all client connections
pub struct HttpProxy {
    config: HttpConfig,
    dialer: Dialer,
    ca: Arc<CertificateAuthority>,
    redirects: Arc<PathRedirects>,
    sessions: SessionLog,
    upstream: TlsConnector,
}

impl std::fmt::Debug for HttpProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProxy")
            .field("config", &self.config)
            .field("dialer", &self.dialer)
            .finish()
    }
}

impl HttpProxy {
    /// Create the proxy
    pub fn new(
        config: HttpConfig,
        dialer: Dialer,
        ca: Arc<CertificateAuthority>,
        redirects: Arc<PathRedirects>,
        sessions: SessionLog,
    ) -> Self {
        let upstream = tls::upstream_connector(config.verify_upstream);
        Self {
            config,
            dialer,
            ca,
            redirects,
            sessions,
            upstream,
        }
    }

    /// Serve a plain HTTP client connection
    ///
    /// Consumes the caller's reference to `client`.
    pub async fn handle(self: Arc<Self>, client: SharedStream) -> Result<()> {
        self.serve(client, Scheme::Http, None).await
    }

    fn serve(
        self: Arc<Self>,
        mut client: SharedStream,
        scheme: Scheme,
        tls_target: Option<TargetAddr>,
    ) -> Served {
        Box::pin(async move {
            let result = self
                .serve_one(&mut client, scheme, tls_target.as_ref())
                .await;
            let _ = client.close().await;
            result
        })
    }

    async fn serve_one(
        self: &Arc<Self>,
        client: &mut SharedStream,
        scheme: Scheme,
        tls_target: Option<&TargetAddr>,
    ) -> Result<()> {
        let head = match RequestHead::read(client).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.respond_error(client, 400, &e.to_string()).await;
                return Err(e.into());
            }
        };
        debug!("{} {} ({})", head.method, head.uri, scheme.as_str());

        if head.is_connect() {
            self.connect(client, head, scheme).await
        } else {
            self.request(client, head, scheme, tls_target).await
        }
    }

    async fn connect(
        self: &Arc<Self>,
        client: &mut SharedStream,
        head: RequestHead,
        scheme: Scheme,
    ) -> Result<()> {
        let target = match TargetAddr::from_authority(&head.uri, HTTPS_PORT) {
            Ok(target) => target,
            Err(e) => {
                self.respond_error(client, 503, &e.to_string()).await;
                return Err(e);
            }
        };
        info!("CONNECT {}", target);
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        client.flush().await?;

        if scheme == Scheme::Http && self.config.decrypt_https {
            let sniffed = client
                .peek(mitm::SNIFF_LEN)
                .await
                .with_context(|| format!("Failed to sniff tunnel to {}", target))?;
            if mitm::is_client_hello(&sniffed) {
                debug!(
                    "{} handshake on tunnel to {}",
                    mitm::record_version(sniffed[2]),
                    target
                );
                let tls = mitm::terminate(&self.ca, client.open(), &target.host()).await?;
                return self.clone().serve(tls, Scheme::Https, Some(target)).await;
            }
        }

        let request = RequestInfo {
            method: head.method.clone(),
            host: head.uri.clone(),
            full_url: format!("https://{}", head.uri),
            url: head.uri.clone(),
            protocol: Protocol::Tunnel,
            version: format!("HTTP/1.{}", head.version),
            headers: header_map(&head.headers),
            query: BTreeMap::new(),
            content_type: None,
        };
        let mut session = SessionInfo::new(client.peer_addr(), request);
        self.sessions.begin(&session);

        let result = match self.dialer.dial(&target).await {
            Ok(remote) => {
                relay::bridge(client.open(), remote).await;
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.sessions.end(&mut session);
        result
    }

    async fn request(
        &self,
        client: &mut SharedStream,
        head: RequestHead,
        scheme: Scheme,
        tls_target: Option<&TargetAddr>,
    ) -> Result<()> {
        let host = request_host(&head, tls_target);
        let full = full_url(scheme.as_str(), &host, &head.uri);
        let mut session = SessionInfo::new(
            client.peer_addr(),
            request_info(&head, scheme, &host, &full),
        );
        self.sessions.begin(&session);
        let result = self.exchange(client, head, scheme, &full, &mut session).await;
        self.sessions.end(&mut session);
        result
    }

    async fn exchange(
        &self,
        client: &mut SharedStream,
        head: RequestHead,
        scheme: Scheme,
        full: &str,
        session: &mut SessionInfo,
    ) -> Result<()> {
        if full == self.config.cert_download_url() {
            info!("Root certificate requested");
            return self.serve_root_cert(client).await;
        }
        if full == self.config.hello_page_url {
            info!("Hello page requested");
            let page = pages::hello_page(
                &self.config.server_name,
                &head.headers,
                &self.config.cert_download_url(),
            );
            self.respond(client, 200, "text/html; charset=utf-8", &[], page.as_bytes())
                .await?;
            return Ok(());
        }
        if let Some(redirect) = self.redirects.lookup(full).await {
            return self.serve_redirect(client, redirect).await;
        }

        let target = match target_of(full, scheme) {
            Ok(target) => target,
            Err(e) => {
                self.respond_error(client, 503, &e.to_string()).await;
                return Err(e);
            }
        };

        let mut remote = match self.dialer.dial(&target).await {
            Ok(remote) => remote,
            Err(e) => {
                self.respond_error(client, 503, &format!("{:#}", e)).await;
                return Err(e);
            }
        };
        if scheme == Scheme::Https {
            remote = match tls::wrap_client(&self.upstream, remote, &target.host()).await {
                Ok(remote) => remote,
                Err(e) => {
                    self.respond_error(client, 503, &format!("{:#}", e)).await;
                    return Err(e);
                }
            };
        }

        let result = self.forward(client, &mut remote, head, &target, session).await;
        let _ = remote.close().await;
        result
    }

    async fn forward(
        &self,
        client: &mut SharedStream,
        remote: &mut SharedStream,
        mut head: RequestHead,
        target: &TargetAddr,
        session: &mut SessionInfo,
    ) -> Result<()> {
        let request_body = BodyKind::of_request(&head);
        let path = origin_form(&head.uri).to_string();
        head.headers.strip_hop_by_hop();
        head.headers.set("Connection", "close");
        if head.headers.get("Host").is_none() {
            head.headers.set("Host", session.request.host.clone());
        }

        remote.write_all(&head.encode(&path)).await?;
        match request_body {
            BodyKind::Fixed(n) => {
                copy_exact(client, remote, n).await?;
            }
            BodyKind::Chunked => {
                copy_chunked(client, remote, true).await?;
            }
            BodyKind::Empty | BodyKind::UntilEof => {}
        }
        remote.flush().await?;

        let mut response = loop {
            let response = match ResponseHead::read(remote).await {
                Ok(response) => response,
                Err(e) => {
                    self.respond_error(client, 503, &e.to_string()).await;
                    return Err(anyhow!(e).context(format!("No response from {}", target)));
                }
            };
            if (100..200).contains(&response.status) && response.status != 101 {
                client.write_all(&response.encode()).await?;
                continue;
            }
            break response;
        };

        session.response = Some(response_info(&response));
        let body = BodyKind::of_response(&head.method, &response);
        response.headers.strip_hop_by_hop();
        response.headers.set("Connection", "close");
        client.write_all(&response.encode()).await?;

        let start = Instant::now();
        let mut counted = CountingWriter::new(client);
        let copied = match body {
            BodyKind::Empty => Ok(0),
            BodyKind::Chunked => copy_chunked(remote, &mut counted, true).await,
            BodyKind::Fixed(n) => copy_exact(remote, &mut counted, n).await,
            BodyKind::UntilEof => tokio::io::copy(remote, &mut counted).await,
        };
        let error = match copied {
            Ok(_) => counted.flush().await.err(),
            Err(e) => Some(e),
        };
        let stats = RelayStats {
            flow: Flow::In,
            bytes: counted.written(),
            elapsed: start.elapsed(),
            error,
        };
        info!("{} {}", target, stats);
        match stats.error {
            Some(e) => Err(anyhow!(e).context(format!("Response body from {} failed", target))),
            None => Ok(()),
        }
    }

    async fn serve_root_cert(&self, client: &mut SharedStream) -> Result<()> {
        match self.ca.root_der().await {
            Ok(der) => {
                self.respond(client, 200, pages::CERT_CONTENT_TYPE, &[], der.as_ref())
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.respond_error(client, 500, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    async fn serve_redirect(&self, client: &mut SharedStream, redirect: Redirect) -> Result<()> {
        match redirect {
            Redirect::Custom {
                status,
                content_type,
                headers,
                body,
            } => {
                self.respond(client, status, &content_type, &headers, body.as_bytes())
                    .await?;
            }
            Redirect::NotFound => {
                self.respond(client, 404, "text/plain", &[], b"Not Found")
                    .await?;
            }
            Redirect::File(path) => {
                info!("Serving local file {:?}", path);
                let mut file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) => {
                        self.respond_error(client, 500, &e.to_string()).await;
                        return Err(e).with_context(|| format!("Failed to open {:?}", path));
                    }
                };
                let len = file.metadata().await?.len();
                let mut head = self.local_head(200, redirect::content_type_for(&path));
                head.headers.append("Content-Length", len.to_string());
                client.write_all(&head.encode()).await?;
                tokio::io::copy(&mut file, client).await?;
                client.flush().await?;
            }
        }
        Ok(())
    }

    fn local_head(&self, status: u16, content_type: &str) -> ResponseHead {
        let mut head = ResponseHead::new(status);
        head.headers.append("Server", self.config.server_name.clone());
        head.headers.append("Content-Type", content_type);
        head.headers.append("Connection", "close");
        head
    }

    async fn respond(
        &self,
        client: &mut SharedStream,
        status: u16,
        content_type: &str,
        extra: &[(String, String)],
        body: &[u8],
    ) -> io::Result<()> {
        let mut head = self.local_head(status, content_type);
        for (k, v) in extra {
            head.headers.append(k.clone(), v.clone());
        }
        let with_body = status != 204 && status != 304;
        if with_body {
            head.headers.append("Content-Length", body.len().to_string());
        }
        client.write_all(&head.encode()).await?;
        if with_body {
            client.write_all(body).await?;
        }
        client.flush().await
    }

    async fn respond_error(&self, client: &mut SharedStream, status: u16, message: &str) {
        warn!("Answering {}: {}", status, message);
        if let Err(e) = self
            .respond(client, status, "text/plain; charset=utf-8", &[], message.as_bytes())
            .await
        {
            debug!("Failed to send error response: {}", e);
        }
    }
}

/// Copy exactly `n` bytes
async fn copy_exact<W>(src: &mut SharedStream, dst: &mut W, n: u64) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *src).take(n), dst).await?;
    if copied != n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("body truncated at {} of {} bytes", copied, n),
        ));
    }
    Ok(copied)
}

/// Host the request is addressed to
fn request_host(head: &RequestHead, tls_target: Option<&TargetAddr>) -> String {
    if let Some(host) = head.headers.get("Host") {
        return host.trim().to_string();
    }
    if let Ok(url) = Url::parse(&head.uri) {
        if let Some(host) = url.host_str() {
            return match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
        }
    }
    tls_target.map(|t| t.to_string()).unwrap_or_default()
}

/// Dial target for an absolute request URL
fn target_of(full: &str, scheme: Scheme) -> Result<TargetAddr> {
    let url = Url::parse(full).with_context(|| format!("Invalid request URL: {}", full))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("No host in request URL: {}", full))?;
    let default_port = match scheme {
        Scheme::Http => HTTP_PORT,
        Scheme::Https => HTTPS_PORT,
    };
    let port = url.port_or_known_default().unwrap_or(default_port);
    Ok(TargetAddr::from_host(host, port))
}

fn header_map(headers: &head::Headers) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn request_info(head: &RequestHead, scheme: Scheme, host: &str, full: &str) -> RequestInfo {
    let query = Url::parse(full)
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default();
    RequestInfo {
        method: head.method.clone(),
        host: host.to_string(),
        full_url: full.to_string(),
        url: origin_form(&head.uri).to_string(),
        protocol: scheme.protocol(),
        version: format!("HTTP/1.{}", head.version),
        headers: header_map(&head.headers),
        query,
        content_type: head.headers.get("Content-Type").map(str::to_string),
    }
}

fn response_info(head: &ResponseHead) -> ResponseInfo {
    ResponseInfo {
        status: head.status,
        reason: head.reason.clone(),
        version: format!("HTTP/1.{}", head.version),
        body_size: if head.headers.is_chunked() {
            None
        } else {
            head.headers.content_length()
        },
        content_type: head.headers.get("Content-Type").map(str::to_string),
        headers: header_map(&head.headers),
    }
}
