//! Session records
//!
//! Each proxied request produces a [`SessionInfo`] that is announced when
//! the request head is known and again when the exchange ends. Events go
//! through a bounded channel with `try_send`; a full channel drops the event
//! instead of stalling the data path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How the request reached the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Plain proxied HTTP
    Http,
    /// HTTP inside an intercepted TLS session
    Https,
    /// Opaque CONNECT tunnel
    Tunnel,
}

/// Request side of a session
#[derive(Debug, Clone, Serialize)]
pub struct RequestInfo {
    /// Method token
    pub method: String,
    /// Requested host (authority)
    pub host: String,
    /// Absolute URL
    pub full_url: String,
    /// Origin-form path and query
    pub url: String,
    /// Transport the request arrived on
    pub protocol: Protocol,
    /// Protocol version
    pub version: String,
    /// Request headers
    pub headers: BTreeMap<String, String>,
    /// Decoded query parameters
    pub query: BTreeMap<String, String>,
    /// Declared request content type
    pub content_type: Option<String>,
}

/// Response side of a session
#[derive(Debug, Clone, Serialize)]
pub struct ResponseInfo {
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Protocol version
    pub version: String,
    /// Declared body size, `None` when chunked or delimited by EOF
    pub body_size: Option<u64>,
    /// Response content type
    pub content_type: Option<String>,
    /// Response headers
    pub headers: BTreeMap<String, String>,
}

/// One proxied exchange
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session id (hex nanosecond timestamp)
    pub sid: String,
    /// When the request was seen
    pub begin_time: DateTime<Utc>,
    /// When the exchange finished
    pub end_time: Option<DateTime<Utc>>,
    /// Client address
    pub remote_addr: Option<SocketAddr>,
    /// Request metadata
    pub request: RequestInfo,
    /// Response metadata, once a response head was seen
    pub response: Option<ResponseInfo>,
}

impl SessionInfo {
    /// New session starting now
    pub fn new(remote_addr: Option<SocketAddr>, request: RequestInfo) -> Self {
        let now = Utc::now();
        SessionInfo {
            sid: format!("{:x}", now.timestamp_nanos_opt().unwrap_or_default()),
            begin_time: now,
            end_time: None,
            remote_addr,
            request,
            response: None,
        }
    }

    /// Whether the session was finalized
    pub fn is_done(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Event delivered to the session sink
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "session", rename_all = "lowercase")]
pub enum SessionEvent {
    /// Request head observed
    Begin(SessionInfo),
    /// Exchange finished
    End(SessionInfo),
}

/// Non-blocking producer side of the session sink
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl SessionLog {
    /// A log that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A log feeding the returned receiver
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    /// A log drained into `tracing` by a background task
    ///
    /// The task stops on shutdown or when every producer is gone.
    pub fn spawn(
        capacity: usize,
        shutdown_rx: broadcast::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (log, rx) = Self::channel(capacity);
        (log, Self::drain(rx, shutdown_rx))
    }

    /// Drain `rx` into `tracing` until shutdown or until it is closed
    pub fn drain(
        mut rx: mpsc::Receiver<SessionEvent>,
        mut shutdown_rx: broadcast::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => write_event(&event),
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Session log stopped");
        })
    }

    /// Announce a new session
    pub fn begin(&self, info: &SessionInfo) {
        self.emit(|| SessionEvent::Begin(info.clone()));
    }

    /// Finalize a session and announce it
    ///
    /// Calling this twice for the same session only emits once.
    pub fn end(&self, info: &mut SessionInfo) {
        if info.is_done() {
            return;
        }
        info.end_time = Some(Utc::now());
        self.emit(|| SessionEvent::End(info.clone()));
    }

    fn emit(&self, event: impl FnOnce() -> SessionEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(e) = tx.try_send(event()) {
            debug!("Session event dropped: {}", e);
        }
    }
}

fn write_event(event: &SessionEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: "sotproxy::session", "{}", json),
        Err(e) => debug!("Failed to encode session event: {}", e),
    }
}
