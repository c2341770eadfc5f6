//! Sotproxy - Multi-protocol forward proxy
//!
//! This is the main entry point for the Sotproxy application.

use anyhow::Result;
use clap::Parser;
use sotproxy::client::Client;
use sotproxy::config::{load_config, Config, Mode, TunnelConfig};
use sotproxy::server::run_server;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Sotproxy - SOCKS4/5 and HTTP proxy with TLS interception and relay tunnel
#[derive(Parser, Debug)]
#[command(name = "sotproxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    listen: Option<String>,

    /// Remote tunnel server to relay through (client mode)
    #[arg(long)]
    remote: Option<String>,

    /// Run as tunnel server
    #[arg(long)]
    server: bool,

    /// Intercept HTTPS inside CONNECT tunnels
    #[arg(long)]
    decrypt_https: bool,

    /// Disable HTTP proxy support
    #[arg(long)]
    disable_http: bool,

    /// Certificate store directory
    #[arg(long)]
    cert_cache_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(remote) = &self.remote {
            match config.tunnel.as_mut() {
                Some(tunnel) => tunnel.remote_addr = remote.clone(),
                None => config.tunnel = Some(TunnelConfig::new(remote.clone())),
            }
        }
        if self.server {
            config.mode = Mode::Server;
        }
        if self.decrypt_https {
            config.http.decrypt_https = true;
        }
        if self.disable_http {
            config.http.enabled = false;
        }
        if let Some(dir) = &self.cert_cache_dir {
            config.certs.cache_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let mut config = match &args.config {
        Some(path) => {
            let config = load_config(path)?;
            info!("Configuration loaded from: {:?}", path);
            config
        }
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    info!("Sotproxy v{}", sotproxy::VERSION);

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals (cross-platform)
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received Ctrl+C, shutting down...");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, shutting down...");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to setup SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received Ctrl+C, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            // On Windows, only handle Ctrl+C
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx_clone.send(true);
    });

    match config.mode {
        Mode::Server => run_server(config, shutdown_rx).await,
        Mode::Client => {
            let client = Client::bind(config).await?;
            #[cfg(unix)]
            spawn_reload_on_hangup(client.local_only(), shutdown_tx.subscribe());
            client.run(shutdown_rx).await
        }
    }
}

/// Re-read the local-only file on SIGHUP
#[cfg(unix)]
fn spawn_reload_on_hangup(
    local_only: std::sync::Arc<sotproxy::rules::LocalOnlyList>,
    mut shutdown_rx: broadcast::Receiver<bool>,
) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("Failed to setup SIGHUP handler: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => match local_only.reload() {
                    Ok(()) => info!("Local-only list reloaded ({} entries)", local_only.list().len()),
                    Err(e) => tracing::warn!("Local-only reload failed: {:#}", e),
                },
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
