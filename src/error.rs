//! Error types for Sotproxy
//!
//! This module defines the error taxonomy shared by the protocol engines,
//! the certificate authority and the tunnel codec.

use std::io;
use thiserror::Error;

/// Main error type for Sotproxy operations
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error (unrecognized first byte, bad request line, ...)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// SOCKS4/SOCKS5 handshake error
    #[error("SOCKS error: {0}")]
    Socks(#[from] SocksError),

    /// TLS handshake or configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate issuance error
    #[error("Certificate error: {0}")]
    Certificate(#[from] CaError),

    /// Tunnel framing error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] FrameError),

    /// HTTP proxying error
    #[error("HTTP error: {0}")]
    Http(String),
}

/// SOCKS handshake errors
///
/// Every variant is terminal for the connection it was raised on.
#[derive(Error, Debug)]
pub enum SocksError {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// Short read or write on the handshake stream
    #[error("Handshake IO error: {0}")]
    Io(#[from] io::Error),
}

/// Certificate authority errors
#[derive(Error, Debug)]
pub enum CaError {
    /// Key or certificate generation failed
    #[error("Failed to generate certificate: {0}")]
    Generation(String),

    /// Stored material could not be parsed
    #[error("Failed to parse certificate material: {0}")]
    Parse(String),

    /// Certificate store IO failed
    #[error("Certificate store error: {0}")]
    Store(#[from] io::Error),
}

/// Tunnel frame errors
#[derive(Error, Debug)]
pub enum FrameError {
    /// Declared target length exceeds the configured maximum
    #[error("Target length {len} exceeds maximum {max}")]
    TooLong {
        /// Declared length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// Empty target
    #[error("Empty target address")]
    Empty,

    /// Target bytes are not UTF-8
    #[error("Target address is not valid UTF-8")]
    InvalidUtf8,

    /// Truncated frame or transport failure
    #[error("Frame IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocksReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<SocksReplyCode> for u8 {
    fn from(code: SocksReplyCode) -> Self {
        code as u8
    }
}

impl From<&io::Error> for SocksReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => SocksReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => SocksReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => SocksReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => SocksReplyCode::ConnectionNotAllowed,
            _ => SocksReplyCode::GeneralFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks_reply_code_to_u8() {
        assert_eq!(u8::from(SocksReplyCode::Succeeded), 0x00);
        assert_eq!(u8::from(SocksReplyCode::GeneralFailure), 0x01);
        assert_eq!(u8::from(SocksReplyCode::CommandNotSupported), 0x07);
        assert_eq!(u8::from(SocksReplyCode::AddressTypeNotSupported), 0x08);
    }

    #[test]
    fn test_socks_reply_code_from_io_error() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(SocksReplyCode::from(&err), SocksReplyCode::ConnectionRefused);

        let err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(SocksReplyCode::from(&err), SocksReplyCode::HostUnreachable);

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            SocksReplyCode::from(&err),
            SocksReplyCode::ConnectionNotAllowed
        );

        let err = io::Error::new(io::ErrorKind::Other, "other");
        assert_eq!(SocksReplyCode::from(&err), SocksReplyCode::GeneralFailure);
    }

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::Config("invalid config".to_string());
        assert_eq!(format!("{}", err), "Configuration error: invalid config");

        let err = ProxyError::Protocol("unknown first byte 0x16".to_string());
        assert_eq!(
            format!("{}", err),
            "Protocol error: unknown first byte 0x16"
        );

        let err = ProxyError::Tls("handshake failed".to_string());
        assert_eq!(format!("{}", err), "TLS error: handshake failed");
    }

    #[test]
    fn test_proxy_error_from_socks() {
        let err: ProxyError = SocksError::NoAcceptableMethod.into();
        assert!(matches!(err, ProxyError::Socks(_)));
    }

    #[test]
    fn test_proxy_error_from_frame() {
        let err: ProxyError = FrameError::TooLong { len: 9000, max: 1024 }.into();
        assert_eq!(
            format!("{}", err),
            "Tunnel error: Target length 9000 exceeds maximum 1024"
        );
    }

    #[test]
    fn test_socks_error_display() {
        let err = SocksError::UnsupportedVersion(6);
        assert_eq!(format!("{}", err), "Unsupported SOCKS version: 6");

        let err = SocksError::CommandNotSupported(0x02);
        assert_eq!(format!("{}", err), "Command not supported: 2");

        let err = SocksError::AddressTypeNotSupported(0x99);
        assert_eq!(format!("{}", err), "Address type not supported: 153");
    }

    #[test]
    fn test_ca_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: CaError = io_err.into();
        assert!(matches!(err, CaError::Store(_)));
    }
}
