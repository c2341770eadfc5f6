//! Proxy configuration types
//!
//! Root configuration plus the HTTP, certificate, rule and session sections.

use super::{ServerConfig, TcpConfig, TunnelConfig};
use crate::ca::{DEFAULT_CACHE_CAPACITY, DEFAULT_LEAF_VALIDITY_DAYS};
use crate::helper::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DIAGNOSTICS_INTERVAL_SECS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn default_listen() -> String {
    "0.0.0.0:8999".to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_diagnostics_interval() -> u64 {
    DEFAULT_DIAGNOSTICS_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

/// Which listener the process runs
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Client-facing SOCKS/HTTP proxy
    #[default]
    Client,
    /// Tunnel server (egress for remote client instances)
    Server,
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Listener mode
    #[serde(default)]
    pub mode: Mode,

    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Outbound dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Live-stream dump interval in seconds, 0 disables
    #[serde(default = "default_diagnostics_interval")]
    pub diagnostics_interval: u64,

    /// HTTP proxy settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Certificate authority settings
    #[serde(default)]
    pub certs: CertsConfig,

    /// Relay through a remote server instance; direct dial when absent
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,

    /// Tunnel server identity
    #[serde(default)]
    pub server: ServerConfig,

    /// Host and path rules
    #[serde(default)]
    pub rules: RulesConfig,

    /// Socket options
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Session record settings
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            listen: default_listen(),
            connect_timeout: default_connect_timeout(),
            diagnostics_interval: default_diagnostics_interval(),
            http: HttpConfig::default(),
            certs: CertsConfig::default(),
            tunnel: None,
            server: ServerConfig::default(),
            rules: RulesConfig::default(),
            tcp: TcpConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

fn default_server_name() -> String {
    "Sot".to_string()
}

fn default_hello_page_url() -> String {
    "http://sot.sot/".to_string()
}

/// HTTP proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConfig {
    /// Accept plain HTTP and CONNECT
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Terminate CONNECT-ed TLS locally with forged certificates
    #[serde(default)]
    pub decrypt_https: bool,

    /// `Server` header on locally served responses
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// URL of the built-in hello page
    #[serde(default = "default_hello_page_url")]
    pub hello_page_url: String,

    /// Verify upstream certificates when re-encrypting
    #[serde(default)]
    pub verify_upstream: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            decrypt_https: false,
            server_name: default_server_name(),
            hello_page_url: default_hello_page_url(),
            verify_upstream: false,
        }
    }
}

impl HttpConfig {
    /// URL serving the root certificate
    pub fn cert_download_url(&self) -> String {
        format!("{}do-not-trust.crt", self.hello_page_url)
    }
}

fn default_cache_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_leaf_validity_days() -> u32 {
    DEFAULT_LEAF_VALIDITY_DAYS
}

/// Certificate authority configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CertsConfig {
    /// Directory holding the `easypki` store
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Issue wildcard leaves
    #[serde(default = "default_true")]
    pub wildcard: bool,

    /// In-memory leaf cache size
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Leaf validity in days
    #[serde(default = "default_leaf_validity_days")]
    pub leaf_validity_days: u32,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            wildcard: true,
            cache_capacity: default_cache_capacity(),
            leaf_validity_days: default_leaf_validity_days(),
        }
    }
}

/// Host and path rules
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RulesConfig {
    /// Hosts always dialed directly (regexes)
    #[serde(default)]
    pub local_only: Vec<String>,

    /// File with one local-only regex per line
    #[serde(default)]
    pub local_only_file: Option<PathBuf>,

    /// Exact host rewrites
    #[serde(default)]
    pub host_mapping: HashMap<String, String>,

    /// Path redirect table, matched in order
    #[serde(default)]
    pub redirect: Vec<RedirectRule>,
}

/// Kind of a path redirect
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RedirectKind {
    /// Fixed status, headers and body
    Custom,
    /// Serve one file
    File,
    /// Serve files below a directory
    Folder,
}

/// What to do when a redirect target cannot be opened
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    /// Forward the request as if no rule matched
    #[default]
    Source,
    /// Answer 404
    NotFound,
}

/// One path redirect entry
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RedirectRule {
    /// Regex (custom, file) or URL prefix (folder)
    pub pattern: String,

    /// Entry kind
    pub kind: RedirectKind,

    /// Status code (custom), file path (file) or directory (folder)
    pub target: String,

    /// Body of a custom response
    #[serde(default)]
    pub body: String,

    /// Content type of a custom response
    #[serde(default)]
    pub content_type: Option<String>,

    /// Extra headers of a custom response
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Behavior when the target is missing
    #[serde(default)]
    pub fallback: Fallback,
}

fn default_session_channel() -> usize {
    1024
}

/// Session record configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    /// Emit session records to the log
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Buffered events before new ones are dropped
    #[serde(default = "default_session_channel")]
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: default_session_channel(),
        }
    }
}
