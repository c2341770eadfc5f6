//! # Sotproxy - Multi-protocol forward proxy with an optional TLS tunnel
//!
//! Sotproxy accepts SOCKS4/4A, SOCKS5 and HTTP proxy clients on a single
//! port, recognizing the protocol from the first byte of each connection.
//! Targets are dialed directly or through a remote Sotproxy instance running
//! in server mode, reached over TLS.
//!
//! ## Features
//!
//! - **Protocol sniffing**: SOCKS4/4A, SOCKS5 and HTTP on one listener
//! - **Tunnel relay**: length-prefixed target announcement over TLS to a
//!   remote egress instance, bypassed for local-only hosts
//! - **HTTPS interception**: optional MITM of CONNECT tunnels with leaf
//!   certificates signed by a locally generated root
//! - **Shared streams**: reference-counted handles with half-duplex close so
//!   each relay direction finishes independently
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sotproxy::config::load_config;
//! use sotproxy::client::run_client;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("sotproxy.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_client(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! App -> [client] Sotproxy ==TLS tunnel==> [server] Sotproxy -> Target
//!                      \------------ direct / local-only -----> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod ca;
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod helper;
pub mod http;
pub mod protocol;
pub mod relay;
pub mod rules;
pub mod server;
pub mod socks;
pub mod stream;
pub mod transport;

// Re-export commonly used items
pub use client::run_client;
pub use config::{load_config, Config, Mode};
pub use error::{ProxyError, SocksError};
pub use server::run_server;
pub use stream::SharedStream;

/// Version of the Sotproxy library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "sotproxy");
    }
}
