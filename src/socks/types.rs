//! Target address type
//!
//! The `host:port` a handshake (SOCKS, CONNECT, tunnel frame) resolves to.

use anyhow::{Context, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Destination requested by a client
///
/// Either a literal socket address or a domain name that is resolved at dial
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// Create a new TargetAddr from an IPv4 address and port
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Create a new TargetAddr from an IPv6 address and port
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port))
    }

    /// Create a new TargetAddr from a host string and port
    ///
    /// IP literals (with or without IPv6 brackets) become [`TargetAddr::Ip`].
    pub fn from_host(host: &str, port: u16) -> Self {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }

    /// Parse an HTTP authority (`host`, `host:port`, `[v6]:port`)
    ///
    /// `default_port` is used when the authority carries none.
    pub fn from_authority(authority: &str, default_port: u16) -> Result<Self> {
        if authority.is_empty() {
            anyhow::bail!("Empty authority");
        }
        if let Ok(addr) = authority.parse::<SocketAddr>() {
            return Ok(TargetAddr::Ip(addr));
        }
        if authority.starts_with('[') {
            let end = authority
                .find(']')
                .with_context(|| format!("Unterminated IPv6 literal: {}", authority))?;
            let ip: Ipv6Addr = authority[1..end]
                .parse()
                .with_context(|| format!("Invalid IPv6 literal: {}", authority))?;
            let port = match authority[end + 1..].strip_prefix(':') {
                Some(p) => p
                    .parse()
                    .with_context(|| format!("Invalid port in: {}", authority))?,
                None => default_port,
            };
            return Ok(TargetAddr::ipv6(ip, port));
        }
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port
                    .parse()
                    .with_context(|| format!("Invalid port in: {}", authority))?;
                Ok(TargetAddr::from_host(host, port))
            }
            _ => Ok(TargetAddr::from_host(authority, default_port)),
        }
    }

    /// Host part without the port
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Same address with the host replaced
    pub fn with_host(&self, host: &str) -> Self {
        TargetAddr::from_host(host, self.port())
    }

    /// Resolve the address to a SocketAddr
    ///
    /// For IP addresses, this returns immediately.
    /// For domain names, this performs DNS resolution.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(domain, port) => {
                let resolved = tokio::net::lookup_host((domain.as_str(), *port))
                    .await
                    .with_context(|| format!("Failed to resolve domain: {}", domain))?
                    .next()
                    .with_context(|| format!("No addresses found for domain: {}", domain))?;
                Ok(resolved)
            }
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for TargetAddr {
    type Err = anyhow::Error;

    /// Parse `host:port`; the port is mandatory
    fn from_str(s: &str) -> Result<Self> {
        let target = TargetAddr::from_authority(s, 0)?;
        if target.port() == 0 && !s.ends_with(":0") {
            anyhow::bail!("Missing port in target: {}", s);
        }
        Ok(target)
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}
