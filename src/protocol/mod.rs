//! Tunnel protocol for Sotproxy
//!
//! A client instance relays through a remote server instance by opening a
//! TLS session and announcing the target with a length-prefixed frame.

mod codec;

pub use codec::{
    encode_target, read_target, write_target, DEFAULT_MAX_TARGET_LEN, LEN_PREFIX_SIZE,
};
