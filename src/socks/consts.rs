//! SOCKS protocol constants
//!
//! Wire values for the SOCKS4/4A and SOCKS5 handshakes.

/// SOCKS4 protocol version
pub const SOCKS4_VERSION: u8 = 0x04;

/// SOCKS4 reply version byte
pub const SOCKS4_REPLY_VERSION: u8 = 0x00;

/// SOCKS4 CONNECT command
pub const SOCKS4_CMD_CONNECT: u8 = 0x01;

/// SOCKS4 request granted
pub const SOCKS4_REPLY_GRANTED: u8 = 0x5A;

/// SOCKS4 request rejected or failed
pub const SOCKS4_REPLY_REJECTED: u8 = 0x5B;

/// Maximum length of the null-terminated SOCKS4 user id and SOCKS4A domain
pub const SOCKS4_MAX_FIELD_LEN: usize = 255;

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods
/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
/// No acceptable methods
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

// Commands
/// TCP CONNECT command
pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

// Address types
/// IPv4 address
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
/// Domain name
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

/// Reserved byte value (always 0x00)
pub const SOCKS5_RESERVED: u8 = 0x00;

/// Maximum domain name length
pub const MAX_DOMAIN_LEN: usize = 255;
