//! Configuration module for Sotproxy
//!
//! This module provides configuration types, TOML parsing and validation.

mod proxy;
mod transport;

pub use proxy::{
    CertsConfig, Config, Fallback, HttpConfig, Mode, RedirectKind, RedirectRule, RulesConfig,
    SessionConfig,
};
pub use transport::{ServerConfig, TcpConfig, TlsConfig, TunnelConfig};

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}

impl Config {
    /// Reject inconsistent settings before anything is started
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            bail!("Listen address must not be empty");
        }
        if self.server.certificate.is_some() != self.server.cert_key.is_some() {
            bail!("server.certificate and server.cert_key must be set together");
        }
        check_target_len(self.server.max_target_len, "server.max_target_len")?;
        if let Some(tunnel) = &self.tunnel {
            if tunnel.remote_addr.trim().is_empty() {
                bail!("tunnel.remote_addr must not be empty");
            }
            check_target_len(tunnel.max_target_len, "tunnel.max_target_len")?;
        }
        if self.certs.cache_capacity == 0 {
            bail!("certs.cache_capacity must be greater than 0");
        }
        for pattern in &self.rules.local_only {
            Regex::new(pattern)
                .with_context(|| format!("Invalid local-only pattern: {}", pattern))?;
        }
        for rule in &self.rules.redirect {
            if rule.kind != RedirectKind::Folder {
                Regex::new(&rule.pattern)
                    .with_context(|| format!("Invalid redirect pattern: {}", rule.pattern))?;
            }
            if rule.kind == RedirectKind::Custom && rule.target.parse::<u16>().is_err() {
                bail!("Redirect {} needs a numeric status target", rule.pattern);
            }
        }
        Ok(())
    }
}

fn check_target_len(len: usize, field: &str) -> Result<()> {
    if len == 0 || len > u16::MAX as usize {
        bail!("{} must be between 1 and {}", field, u16::MAX);
    }
    Ok(())
}
