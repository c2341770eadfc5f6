//! Transport configuration types
//!
//! Socket options, the tunnel client's TLS settings and the tunnel server's
//! identity.

use crate::protocol::DEFAULT_MAX_TARGET_LEN;
use serde::{Deserialize, Serialize};

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

fn default_true() -> bool {
    true
}

/// TCP socket configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_true")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: true,
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

/// TLS client settings for the tunnel
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    /// Server name sent as SNI and verified (defaults to the remote host)
    #[serde(default)]
    pub hostname: Option<String>,

    /// Extra PEM root to trust
    #[serde(default)]
    pub trusted_root: Option<String>,

    /// Accept any server certificate
    #[serde(default = "default_true")]
    pub skip_verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            trusted_root: None,
            skip_verify: true,
        }
    }
}

fn default_max_target_len() -> usize {
    DEFAULT_MAX_TARGET_LEN
}

/// Tunnel client configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Remote server instance (`host:port`)
    pub remote_addr: String,

    /// Maximum announced target length
    #[serde(default = "default_max_target_len")]
    pub max_target_len: usize,

    /// TLS settings
    #[serde(default)]
    pub tls: TlsConfig,
}

impl TunnelConfig {
    /// Tunnel to `remote_addr` with default settings
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            max_target_len: default_max_target_len(),
            tls: TlsConfig::default(),
        }
    }
}

/// Tunnel server identity and limits
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// PEM certificate chain; a self-signed one is generated when absent
    #[serde(default)]
    pub certificate: Option<String>,

    /// PEM private key for `certificate`
    #[serde(default)]
    pub cert_key: Option<String>,

    /// Maximum accepted target length
    #[serde(default = "default_max_target_len")]
    pub max_target_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            certificate: None,
            cert_key: None,
            max_target_len: default_max_target_len(),
        }
    }
}
