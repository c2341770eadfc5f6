//! Test utilities and mocks for Sotproxy
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use sotproxy::client::Client;
use sotproxy::config::{Config, Mode, TunnelConfig};
use sotproxy::server::Server;
use std::net::SocketAddr;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Echo server answering every connection until the peer closes
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                let _ = w.shutdown().await;
            });
        }
    });
    addr
}

/// Origin answering one HTTP request with `response`; yields the request head
pub async fn spawn_http_origin(response: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<String>) {
    let (listener, addr) = create_test_listener().await;
    let handle = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let head = read_head(&mut conn).await;
        conn.write_all(response).await.unwrap();
        conn.shutdown().await.unwrap();
        head
    });
    (addr, handle)
}

/// Read until the end of an HTTP head
pub async fn read_head<S: tokio::io::AsyncRead + Unpin>(conn: &mut S) -> String {
    let mut seen = Vec::new();
    let mut byte = [0u8; 1];
    while !seen.ends_with(b"\r\n\r\n") {
        if conn.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        seen.push(byte[0]);
    }
    String::from_utf8_lossy(&seen).into_owned()
}

/// Test configuration builder
pub struct TestConfigBuilder {
    config: Config,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        let mut config = Config::default();
        config.listen = "127.0.0.1:0".to_string();
        config.diagnostics_interval = 0;
        TestConfigBuilder { config }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay through a tunnel server
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.config.tunnel = Some(TunnelConfig::new(addr.to_string()));
        self
    }

    /// Run as tunnel server
    pub fn server(mut self) -> Self {
        self.config.mode = Mode::Server;
        self
    }

    /// Enable HTTPS interception with the store under `dir`
    pub fn decrypt_https(mut self, dir: &Path) -> Self {
        self.config.http.decrypt_https = true;
        self.config.certs.cache_dir = dir.to_path_buf();
        self
    }

    /// Enable or disable HTTP support
    pub fn http_enabled(mut self, enabled: bool) -> Self {
        self.config.http.enabled = enabled;
        self
    }

    /// Add a local-only pattern
    pub fn local_only(mut self, pattern: &str) -> Self {
        self.config.rules.local_only.push(pattern.to_string());
        self
    }

    /// Add a host mapping
    pub fn map_host(mut self, from: &str, to: &str) -> Self {
        self.config
            .rules
            .host_mapping
            .insert(from.to_string(), to.to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config.validate().unwrap();
        self.config
    }
}

/// Running instance; dropping the sender does not stop it, sending does
pub struct Running {
    /// Listener address
    pub addr: SocketAddr,
    /// Shutdown trigger
    pub shutdown: broadcast::Sender<bool>,
}

/// Start a client instance
pub async fn start_client(config: Config) -> Running {
    let client = Client::bind(config).await.unwrap();
    let addr = client.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    tokio::spawn(client.run(rx));
    Running { addr, shutdown }
}

/// Start a tunnel server instance
pub async fn start_server(config: Config) -> Running {
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    tokio::spawn(server.run(rx));
    Running { addr, shutdown }
}

/// Mock SOCKS5 handshake data
pub mod socks5_mock {
    use sotproxy::socks::*;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a connect command to IPv4 address
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_IPV4,
        ];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_DOMAIN,
            domain.len() as u8,
        ];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}

/// Mock SOCKS4 handshake data
pub mod socks4_mock {
    use sotproxy::socks::*;

    /// CONNECT to an IPv4 address with an empty user id
    pub fn create_connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![SOCKS4_VERSION, SOCKS4_CMD_CONNECT];
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd.extend_from_slice(&ip);
        cmd.push(0);
        cmd
    }

    /// SOCKS4A CONNECT to a domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![SOCKS4_VERSION, SOCKS4_CMD_CONNECT];
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd.extend_from_slice(&[0, 0, 0, 1]);
        cmd.extend_from_slice(b"user\0");
        cmd.extend_from_slice(domain.as_bytes());
        cmd.push(0);
        cmd
    }
}
