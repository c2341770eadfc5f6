//! SOCKS module for Sotproxy
//!
//! Handshake engines for SOCKS4/4A and SOCKS5. Each engine reads the
//! handshake from a client stream, writes the protocol reply and returns the
//! requested [`TargetAddr`]; dialing and relaying are left to the caller.

mod consts;
mod types;
pub mod v4;
pub mod v5;

pub use consts::*;
pub use types::TargetAddr;
